use chrono::Local;
use clap::Parser;
use merkle_batch::hashtree::binary::MerkleTree;
use merkle_batch::hashtree::conflict::{Transaction, find_conflicts};
use merkle_batch::{Error, splitmix64};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::create_dir_all;
use std::path::PathBuf;
use std::thread::{self, ScopedJoinHandle};
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod stat;

#[derive(Parser)]
#[command(name = "merkle-bench")]
#[command(author, version, about = "Drive concurrent updates, proofs and batches against a shared Merkle tree")]
struct Args {
  /// Tree depth; the tree holds 2^depth leaves
  #[arg(short, long, default_value_t = 16)]
  depth: u8,

  /// Number of concurrent worker threads
  #[arg(short, long, default_value_t = 32)]
  threads: usize,

  /// Operations performed by each worker
  #[arg(short = 'n', long, default_value_t = 256)]
  operations: usize,

  /// Transactions in the shared batch
  #[arg(short, long, default_value_t = 16)]
  batch: usize,

  /// Seed of the workload generator
  #[arg(long, default_value_t = 0)]
  seed: u64,

  /// Output directory for the latency report
  #[arg(short, long, default_value_t = {std::env::current_dir().unwrap_or_default().to_string_lossy().into_owned()})]
  output: String,

  #[arg(short, long, default_value_t = Local::now().format("%Y%m%d%H%M%S").to_string())]
  session: String,

  /// Log filter used when RUST_LOG is not set
  #[arg(long, default_value = "info")]
  log: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum Operation {
  Update,
  Root,
  ProveAndVerify,
  BatchUpdate,
}

impl Operation {
  fn pick<R: Rng>(rng: &mut R) -> Self {
    match rng.random_range(0..4) {
      0 => Operation::Update,
      1 => Operation::Root,
      2 => Operation::ProveAndVerify,
      _ => Operation::BatchUpdate,
    }
  }
}

impl std::fmt::Display for Operation {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      Operation::Update => "update",
      Operation::Root => "root",
      Operation::ProveAndVerify => "prove+verify",
      Operation::BatchUpdate => "batch-update",
    })
  }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
  let args = Args::parse();
  let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&args.log))?;
  tracing_subscriber::fmt().with_env_filter(filter).with_thread_names(true).init();

  let output = PathBuf::from(&args.output);
  create_dir_all(&output)?;
  println!("Output directory: {:?}", &output);

  let t0 = Instant::now();
  let tree: MerkleTree = MerkleTree::new(args.depth)?;
  let elapse = t0.elapsed();
  println!("[build] depth={}, capacity={}: {:.3}ms", tree.depth(), tree.capacity(), elapse.as_secs_f64() * 1000.0);

  // a shared batch, applied by every worker that draws a batch update, resuming at its own offset
  let mut rng = StdRng::seed_from_u64(args.seed);
  let batch = (0..args.batch)
    .map(|_| {
      let index = rng.random_range(0..tree.capacity());
      Transaction::new(index, splitmix64(index).to_le_bytes().to_vec())
    })
    .collect::<Vec<_>>();
  let conflicts = find_conflicts(&batch, tree.depth())?;
  println!("[batch] {} transactions, {} conflict prefixes: {conflicts}", batch.len(), conflicts.len());

  info!(threads = args.threads, operations = args.operations, seed = args.seed, "starting workers");
  let report = thread::scope(|s| {
    let workers = (0..args.threads)
      .map(|id| {
        let (tree, batch) = (&tree, &batch);
        let seed = splitmix64(args.seed ^ id as u64);
        let operations = args.operations;
        thread::Builder::new().name(format!("worker-{id}")).spawn_scoped(s, move || {
          run_worker(tree, batch, id % batch.len().max(1), operations, seed)
        })
      })
      .collect::<std::io::Result<Vec<_>>>()?;

    collect_reports(workers)
  })?;

  for (operation, stat) in report.stats() {
    println!("  {operation}: {stat}");
  }
  println!("[root] {}", tree.root_hash().to_hex());

  let path = output.join(format!("{}-merkle-bench.csv", args.session));
  report.save_to_csv(&path)?;
  println!("==> {}", path.to_string_lossy());
  Ok(())
}

type WorkerResult = Result<stat::Report<Operation>, Error>;

/// Join every worker and merge their reports. Any panicked worker fails the whole run.
fn collect_reports(
  workers: Vec<ScopedJoinHandle<'_, WorkerResult>>,
) -> Result<stat::Report<Operation>, Box<dyn std::error::Error>> {
  let total = workers.len();
  let mut report = stat::Report::new();
  let mut panicked = 0usize;
  for worker in workers {
    match worker.join() {
      Ok(result) => report.merge(result?),
      Err(_) => {
        warn!("worker panicked");
        panicked += 1;
      }
    }
  }
  if panicked > 0 {
    return Err(format!("{panicked} of {total} workers panicked").into());
  }
  Ok(report)
}

fn run_worker(
  tree: &MerkleTree,
  batch: &[Transaction],
  resume_from: usize,
  operations: usize,
  seed: u64,
) -> WorkerResult {
  let mut rng = StdRng::seed_from_u64(seed);
  let mut report = stat::Report::new();
  for _ in 0..operations {
    let operation = Operation::pick(&mut rng);
    let index = rng.random_range(0..tree.capacity());
    let start = Instant::now();
    match operation {
      Operation::Update => tree.update(index, &splitmix64(index).to_le_bytes())?,
      Operation::Root => {
        std::hint::black_box(tree.root_hash());
      }
      Operation::ProveAndVerify => {
        let snapshot = tree.snapshot();
        match tree.generate_proof_at(&snapshot, index) {
          Ok(proof) => {
            if !tree.verify_proof(&proof, &proof.value, snapshot.hash())? {
              warn!(index, "proof does not verify against its own snapshot");
            }
          }
          Err(Error::NotFound(_)) => (),
          Err(e) => return Err(e),
        }
      }
      Operation::BatchUpdate => tree.batch_update(batch, resume_from)?,
    }
    report.add(operation, start.elapsed());
  }
  Ok(report)
}
