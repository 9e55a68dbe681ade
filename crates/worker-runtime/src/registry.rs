//! Thread-local observer slot.
//!
//! The slot owns the observer. Teardown removes it synchronously before
//! touching anything else, so a lookup never returns a destroyed observer.

use std::{cell::RefCell, rc::Rc};

use crate::observer::WorkerObserver;

thread_local! {
    static CURRENT: RefCell<Option<Rc<WorkerObserver>>> = const { RefCell::new(None) };
}

/// The observer registered on the calling thread, without constructing one.
#[must_use]
pub fn current() -> Option<Rc<WorkerObserver>> {
    CURRENT
        .try_with(|slot| slot.borrow().clone())
        .ok()
        .flatten()
}

#[must_use]
pub fn is_registered() -> bool {
    CURRENT
        .try_with(|slot| slot.borrow().is_some())
        .unwrap_or(false)
}

/// Store `observer` in the empty slot. Returns `false` if the slot is taken
/// or the thread is exiting.
pub(crate) fn register(observer: &Rc<WorkerObserver>) -> bool {
    CURRENT
        .try_with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_some() {
                return false;
            }
            *slot = Some(Rc::clone(observer));
            true
        })
        .unwrap_or(false)
}

/// Clear the slot if it holds `observer`.
///
/// During thread exit the slot is already gone and this is a no-op.
pub(crate) fn unregister(observer: &WorkerObserver) -> bool {
    let removed = CURRENT
        .try_with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot
                .as_ref()
                .is_some_and(|registered| std::ptr::eq(Rc::as_ptr(registered), observer))
            {
                slot.take()
            } else {
                None
            }
        })
        .ok()
        .flatten();
    // Dropped outside the slot borrow; the caller still holds its own handle.
    removed.is_some()
}
