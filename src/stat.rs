use core::f64;
use std::collections::HashMap;
use std::fmt::Display;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Stat {
  pub count: usize,
  pub mean: f64,
  pub median: f64,
  pub std_dev: f64,
  pub min: f64,
  pub max: f64,
}

impl Stat {
  pub fn from_vec(mut data: Vec<f64>) -> Stat {
    if data.is_empty() {
      return Stat { count: 0, mean: f64::NAN, median: f64::NAN, std_dev: f64::NAN, min: f64::NAN, max: f64::NAN };
    }
    let count = data.len();
    data.sort_by(|a, b| a.total_cmp(b));
    let min = data[0];
    let max = data[count - 1];
    let mean = data.iter().sum::<f64>() / count as f64;
    let median = if count % 2 == 0 {
      let mid = count / 2;
      (data[mid - 1] + data[mid]) / 2.0
    } else {
      data[count / 2]
    };
    let variance = data
      .iter()
      .map(|&x| {
        let diff = x - mean;
        diff * diff
      })
      .sum::<f64>()
      / count as f64;
    let std_dev = variance.sqrt();
    Stat { count, mean, median, std_dev, min, max }
  }
}

impl Display for Stat {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    // 2σ (equivalent to 95.4% confidence interval) calculated as a percentage
    let two_sigma_percent = if self.mean > 0.0 { (2.0 * self.std_dev / self.mean) * 100.0 } else { 0.0 };
    f.write_fmt(format_args!(
      "{}: {:.3}µs ±{:.1}% [{:.1}|{:.1}|{:.1}]",
      self.count, self.mean, two_sigma_percent, self.min, self.median, self.max
    ))?;
    Ok(())
  }
}

/// Latency samples in microseconds, grouped by operation.
pub struct Report<X: Display + Clone + std::hash::Hash + Eq + Ord> {
  data_set: HashMap<X, Vec<f64>>,
}

impl<X: Display + Clone + std::hash::Hash + Eq + Ord> Report<X> {
  pub fn new() -> Self {
    Report { data_set: HashMap::new() }
  }

  pub fn add(&mut self, x: X, y: Duration) {
    self.data_set.entry(x).or_default().push(y.as_nanos() as f64 / 1000.0);
  }

  pub fn merge(&mut self, other: Report<X>) {
    for (x, ys) in other.data_set {
      self.data_set.entry(x).or_default().extend(ys);
    }
  }

  /// Statistics per operation, ordered by operation.
  pub fn stats(&self) -> Vec<(X, Stat)> {
    let mut stats =
      self.data_set.iter().map(|(x, ys)| (x.clone(), Stat::from_vec(ys.clone()))).collect::<Vec<_>>();
    stats.sort_by(|(a, _), (b, _)| a.cmp(b));
    stats
  }

  pub fn save_to_csv(&self, path: &Path) -> std::io::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    writeln!(writer, "OPERATION,COUNT,MEAN,MEDIAN,STDDEV,MIN,MAX")?;
    for (x, y) in self.stats() {
      writeln!(
        writer,
        "\"{}\",{},{:.3},{:.3},{:.3},{:.3},{:.3}",
        x, y.count, y.mean, y.median, y.std_dev, y.min, y.max
      )?;
    }
    writer.flush()?;
    Ok(())
  }
}
