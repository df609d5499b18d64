//! Listener registry for connection events
//!
//! A [`Signal`] holds any number of listeners for one event type. Emitting
//! runs them synchronously, in registration order. The listener list is
//! snapshotted first, so a listener may register more listeners or call
//! back into the connection while it runs; listeners added during an
//! emission only see later emissions.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Zero or more listeners of type `F` (usually `dyn Fn(..)`)
pub struct Signal<F: ?Sized> {
    slots: RefCell<Vec<Rc<F>>>,
}

impl<F: ?Sized> Signal<F> {
    /// Create an empty signal
    pub fn new() -> Self {
        Self {
            slots: RefCell::new(Vec::new()),
        }
    }

    /// Register a listener
    pub fn connect(&self, slot: Rc<F>) {
        self.slots.borrow_mut().push(slot);
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.slots.borrow().len()
    }

    /// Check if no listener is registered
    pub fn is_empty(&self) -> bool {
        self.slots.borrow().is_empty()
    }

    /// Drop every listener
    pub fn clear(&self) {
        // Dropping a listener may drop captured handles; do it outside the borrow
        let slots = std::mem::take(&mut *self.slots.borrow_mut());
        drop(slots);
    }

    /// Run `invoke` on each listener in registration order
    pub fn emit(&self, mut invoke: impl FnMut(&F)) {
        let slots = self.slots.borrow().clone();
        for slot in &slots {
            invoke(slot);
        }
    }
}

impl<F: ?Sized> Default for Signal<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ?Sized> fmt::Debug for Signal<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("listeners", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn test_emit_in_registration_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let signal: Signal<dyn Fn(u32)> = Signal::new();
        for id in 0..3 {
            let log = log.clone();
            signal.connect(Rc::new(move |v| log.borrow_mut().push((id, v))));
        }
        signal.emit(|f| f(7));
        assert_eq!(*log.borrow(), vec![(0, 7), (1, 7), (2, 7)]);
    }

    #[test]
    fn test_connect_during_emit() {
        let signal: Rc<Signal<dyn Fn()>> = Rc::new(Signal::new());
        let calls = Rc::new(RefCell::new(0));

        let inner_signal = signal.clone();
        let inner_calls = calls.clone();
        signal.connect(Rc::new(move || {
            *inner_calls.borrow_mut() += 1;
            let calls = inner_calls.clone();
            inner_signal.connect(Rc::new(move || *calls.borrow_mut() += 100));
        }));

        signal.emit(|f| f());
        assert_eq!(*calls.borrow(), 1);
        assert_eq!(signal.len(), 2);

        signal.clear();
        assert!(signal.is_empty());
    }
}
