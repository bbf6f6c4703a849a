//! Conflict detection and per-ancestor locking for batched updates.
//!
//! Every pair of transactions in a batch meets at the node named by the common prefix of their
//! leaf paths. Those prefixes form the batch's conflict set. A transaction whose path runs
//! through a conflict prefix is contended: it is applied while holding the FIFO lock of its
//! deepest contended ancestor. All other transactions are applied without taking any lock.

use std::collections::{BTreeSet, HashMap};
use std::fmt::{self, Display};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use tracing::debug;

use crate::hashtree::binary::MerkleTree;
use crate::hashtree::path::{Prefix, encode};
use crate::hashtree::{Error, Hasher, Result};


#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
  pub index: u64,
  pub value: Vec<u8>,
}

impl Transaction {
  pub fn new<V: Into<Vec<u8>>>(index: u64, value: V) -> Self {
    Transaction { index, value: value.into() }
  }
}

/// Distinct lowest-shared-ancestor prefixes of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictSet(BTreeSet<Prefix>);

impl ConflictSet {
  pub fn contains(&self, prefix: &Prefix) -> bool {
    self.0.contains(prefix)
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Prefix> {
    self.0.iter()
  }

  /// Deepest conflict prefix lying on `path`, if any.
  pub fn contention(&self, path: &Prefix) -> Option<Prefix> {
    self.0.iter().filter(|prefix| prefix.is_ancestor_of(path)).max_by_key(|prefix| prefix.len()).copied()
  }
}

impl Display for ConflictSet {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("[")?;
    for (i, prefix) in self.0.iter().enumerate() {
      if i > 0 {
        f.write_str(", ")?;
      }
      write!(f, "{prefix}")?;
    }
    f.write_str("]")
  }
}

/// Collect the common prefix of every unordered pair of transactions.
pub fn find_conflicts(transactions: &[Transaction], depth: u8) -> Result<ConflictSet> {
  let paths = transactions.iter().map(|tx| encode(tx.index, depth)).collect::<Result<Vec<_>>>()?;
  let mut conflicts = BTreeSet::new();
  for (i, a) in paths.iter().enumerate() {
    for b in &paths[i + 1..] {
      conflicts.insert(a.common(b));
    }
  }
  Ok(ConflictSet(conflicts))
}

impl<H: Hasher> MerkleTree<H> {
  /// Apply `transactions[resume_from..]`, serializing those that share a contended ancestor.
  ///
  /// Every index is validated before the first update, so a failing batch changes nothing.
  pub fn batch_update(&self, transactions: &[Transaction], resume_from: usize) -> Result<()> {
    let conflicts = find_conflicts(transactions, self.depth())?;
    debug!(transactions = transactions.len(), resume_from, %conflicts, "batch update");

    for tx in transactions.iter().skip(resume_from) {
      let path = encode(tx.index, self.depth())?;
      match conflicts.contention(&path) {
        Some(ancestor) => {
          let mut guard = self.locks.acquire(ancestor)?;
          self.update(tx.index, &tx.value)?;
          guard.applied();
        }
        None => self.update(tx.index, &tx.value)?,
      }
    }
    Ok(())
  }
}

/// Lifecycle of a per-ancestor lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  Idle,
  /// Held by the writer with this ticket.
  Claimed(u64),
  /// The holder's update is published and the lock is about to be released.
  Applied(u64),
  /// A holder panicked; every current and future writer on this ancestor fails.
  Poisoned,
}

#[derive(Debug)]
struct LockState {
  next_ticket: u64,
  serving: u64,
  outstanding: usize,
  phase: Phase,
}

/// Ticket lock scoped to one conflict ancestor. Writers are admitted in arrival order.
#[derive(Debug)]
pub struct AncestorLock {
  prefix: Prefix,
  state: Mutex<LockState>,
  turn: Condvar,
}

impl AncestorLock {
  fn new(prefix: Prefix) -> Self {
    let state = LockState { next_ticket: 0, serving: 0, outstanding: 0, phase: Phase::Idle };
    AncestorLock { prefix, state: Mutex::new(state), turn: Condvar::new() }
  }

  fn state(&self) -> Result<MutexGuard<'_, LockState>> {
    self.state.lock().map_err(|_| Error::LockPoisoned(self.prefix))
  }

  fn take_ticket(&self) -> Result<u64> {
    let mut state = self.state()?;
    if state.phase == Phase::Poisoned {
      return Err(Error::LockPoisoned(self.prefix));
    }
    let ticket = state.next_ticket;
    state.next_ticket += 1;
    state.outstanding += 1;
    Ok(ticket)
  }

  fn wait_turn(&self, ticket: u64) -> Result<()> {
    let mut state = self.state()?;
    if state.serving != ticket {
      debug!(prefix = %self.prefix, ticket, serving = state.serving, "waiting for contended ancestor");
    }
    loop {
      if state.phase == Phase::Poisoned {
        return Err(Error::LockPoisoned(self.prefix));
      }
      if state.serving == ticket {
        state.phase = Phase::Claimed(ticket);
        return Ok(());
      }
      state = self.turn.wait(state).map_err(|_| Error::LockPoisoned(self.prefix))?;
    }
  }

  fn mark_applied(&self, ticket: u64) {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    if state.phase == Phase::Claimed(ticket) {
      state.phase = Phase::Applied(ticket);
    }
  }

  /// Give the ticket back. Returns true when nobody else holds or waits on this lock.
  fn release(&self, ticket: u64, held: bool, panicking: bool) -> bool {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    state.outstanding -= 1;
    if held {
      debug_assert_eq!(ticket, state.serving);
      if panicking {
        state.phase = Phase::Poisoned;
      } else if state.phase != Phase::Poisoned {
        state.phase = Phase::Idle;
      }
      state.serving += 1;
      self.turn.notify_all();
    }
    state.outstanding == 0 && state.phase != Phase::Poisoned
  }
}

/// Locks of the ancestors currently contended by some writer.
#[derive(Debug, Default)]
pub struct LockTable {
  locks: Mutex<HashMap<Prefix, Arc<AncestorLock>>>,
}

impl LockTable {
  /// Block until the caller is at the head of `prefix`'s queue.
  pub fn acquire(&self, prefix: Prefix) -> Result<AncestorGuard<'_>> {
    let (lock, ticket) = {
      let mut locks = self.locks.lock().map_err(|_| Error::LockPoisoned(prefix))?;
      let lock = Arc::clone(locks.entry(prefix).or_insert_with(|| Arc::new(AncestorLock::new(prefix))));
      let ticket = lock.take_ticket()?;
      (lock, ticket)
    };

    // the guard owns the ticket from here on so that a failed wait still returns it
    let mut guard = AncestorGuard { table: self, lock, ticket, held: false };
    guard.lock.wait_turn(ticket)?;
    guard.held = true;
    Ok(guard)
  }

  /// Phase of the lock for `prefix`, `None` if no writer holds or waits on it.
  pub fn phase(&self, prefix: &Prefix) -> Option<Phase> {
    let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
    let lock = locks.get(prefix)?;
    let state = lock.state.lock().unwrap_or_else(|e| e.into_inner());
    Some(state.phase)
  }

  /// Number of writers holding or waiting on `prefix`.
  pub fn queued(&self, prefix: &Prefix) -> usize {
    let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
    locks.get(prefix).map(|lock| lock.state.lock().unwrap_or_else(|e| e.into_inner()).outstanding).unwrap_or(0)
  }

  fn release(&self, lock: &Arc<AncestorLock>, ticket: u64, held: bool) {
    let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
    if lock.release(ticket, held, std::thread::panicking())
      && locks.get(&lock.prefix).is_some_and(|current| Arc::ptr_eq(current, lock))
    {
      locks.remove(&lock.prefix);
    }
  }
}

/// Exclusive hold on a contended ancestor, released on drop.
#[derive(Debug)]
pub struct AncestorGuard<'a> {
  table: &'a LockTable,
  lock: Arc<AncestorLock>,
  ticket: u64,
  held: bool,
}

impl AncestorGuard<'_> {
  pub fn prefix(&self) -> Prefix {
    self.lock.prefix
  }

  /// Record that the holder's update has been published.
  pub fn applied(&mut self) {
    self.lock.mark_applied(self.ticket);
  }
}

impl Drop for AncestorGuard<'_> {
  fn drop(&mut self) {
    self.table.release(&self.lock, self.ticket, self.held);
  }
}
