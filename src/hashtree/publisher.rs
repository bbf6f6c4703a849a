use std::sync::{Arc, RwLock};

use tracing::trace;

use crate::hashtree::binary::Node;

/// Single slot holding the currently published root.
///
/// Every published root is an immutable snapshot; a reader that loaded one keeps a fully
/// consistent tree for as long as it holds the `Arc`, regardless of later publications. The
/// slot lock is only held to clone or swap the pointer.
pub struct RootPublisher<D> {
  slot: RwLock<Arc<Node<D>>>,
}

impl<D> RootPublisher<D> {
  pub fn new(root: Arc<Node<D>>) -> Self {
    Self { slot: RwLock::new(root) }
  }

  pub fn load(&self) -> Arc<Node<D>> {
    // the slot only ever holds a complete root, so a poisoned lock still guards a valid value
    let guard = self.slot.read().unwrap_or_else(|e| e.into_inner());
    Arc::clone(&guard)
  }

  /// Publish `root` if the slot still holds `expected`; otherwise hand back the current root.
  pub fn compare_and_publish(&self, expected: &Arc<Node<D>>, root: Arc<Node<D>>) -> Result<(), Arc<Node<D>>> {
    let mut guard = self.slot.write().unwrap_or_else(|e| e.into_inner());
    if Arc::ptr_eq(&guard, expected) {
      *guard = root;
      Ok(())
    } else {
      trace!("root moved under a writer, retrying");
      Err(Arc::clone(&guard))
    }
  }
}
