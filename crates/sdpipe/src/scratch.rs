//! Per-thread scratch arenas.
//!
//! A scratch arena is a thread-local [`Arena`] whose cursor is checkpointed
//! on acquisition and restored when the guard drops, so nested temporary
//! allocations unwind like a stack. Callers that are themselves writing into
//! an arena pass it in the conflict list; `get` never returns a scratch that
//! aliases a conflicting arena. Register at least two scratches per thread
//! so a non-conflicting one can always be found.

use std::cell::RefCell;
use std::ops::{Deref, DerefMut};

use crate::Arena;

thread_local! {
    static POOL: RefCell<Vec<Option<Arena>>> = const { RefCell::new(Vec::new()) };
}

/// Adds `arena` to the calling thread's scratch pool.
pub fn register(arena: Arena) {
    POOL.with(|pool| pool.borrow_mut().push(Some(arena)));
}

/// Number of scratch arenas registered on this thread (checked-out ones
/// included).
pub fn registered() -> usize {
    POOL.with(|pool| pool.borrow().len())
}

/// Acquires a scratch arena that does not alias any arena in `conflicts`.
///
/// Returns `None` when every registered scratch is either checked out or
/// conflicting. The returned guard restores the arena's cursor on drop.
pub fn get(conflicts: &[&Arena]) -> Option<Scratch> {
    POOL.with(|pool| {
        let mut pool = pool.borrow_mut();
        for (slot, entry) in pool.iter_mut().enumerate() {
            let Some(arena) = entry.as_ref() else {
                continue;
            };
            if conflicts.iter().any(|c| c.base() == arena.base()) {
                continue;
            }
            let arena = entry.take().expect("slot checked above");
            let saved = arena.pos();
            return Some(Scratch {
                arena: Some(arena),
                slot,
                saved,
            });
        }
        None
    })
}

/// RAII guard over a checked-out scratch arena.
///
/// Dereferences to [`Arena`]. Dropping the guard seeks the arena back to its
/// acquisition position and returns it to the thread pool, which makes the
/// release idempotent by construction. Guards must not outlive the thread
/// they were acquired on (they are `!Send`).
pub struct Scratch {
    arena: Option<Arena>,
    slot: usize,
    saved: usize,
}

impl Deref for Scratch {
    type Target = Arena;

    fn deref(&self) -> &Arena {
        self.arena.as_ref().expect("scratch arena taken")
    }
}

impl DerefMut for Scratch {
    fn deref_mut(&mut self) -> &mut Arena {
        self.arena.as_mut().expect("scratch arena taken")
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if let Some(mut arena) = self.arena.take() {
            arena.seek(self.saved);
            POOL.with(|pool| {
                let mut pool = pool.borrow_mut();
                pool[self.slot] = Some(arena);
            });
        }
    }
}
