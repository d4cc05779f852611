//! Per-thread record of the plugins and runtimes currently busy on this thread.
//!
//! A call that comes back around to the object already running it (plugin calls the host,
//! the host handler calls the same plugin) would wait on a lock its own thread holds. Entering
//! through [`Entered::enter`] turns that into an error.

use std::cell::RefCell;
use std::ptr;

thread_local! {
    static ACTIVE: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Marks `target` busy on this thread until dropped.
pub(crate) struct Entered {
    key: usize,
}

impl Entered {
    /// Returns `None` if `target` is already busy on this thread.
    pub(crate) fn enter<T>(target: &T) -> Option<Self> {
        let key = ptr::from_ref(target) as usize;
        ACTIVE.with(|active| {
            let mut active = active.borrow_mut();
            if active.contains(&key) {
                None
            } else {
                active.push(key);
                Some(Self { key })
            }
        })
    }

    /// Whether `target` is busy on this thread.
    #[cfg_attr(not(feature = "host"), allow(dead_code))]
    pub(crate) fn is_active<T>(target: &T) -> bool {
        let key = ptr::from_ref(target) as usize;
        ACTIVE.with(|active| active.borrow().contains(&key))
    }
}

impl Drop for Entered {
    fn drop(&mut self) {
        // The thread may already be tearing down its locals.
        let _ = ACTIVE.try_with(|active| {
            let mut active = active.borrow_mut();
            if let Some(pos) = active.iter().rposition(|key| *key == self.key) {
                active.swap_remove(pos);
            }
        });
    }
}
