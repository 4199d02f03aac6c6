//! Single-threaded event emitters with disposable subscriptions.
//!
//! Every observable in Trellis (document changes, channel updates, attendee
//! connect/disconnect) is an [`Emitter`]. Registering a handler returns a
//! [`Subscription`]; dropping it or calling [`Subscription::unsubscribe`]
//! removes the handler.
//!
//! ```text
//! emitter.subscribe(f) ──► Subscription ──drop──► handler removed
//!        │
//!   emit(&event) ──► snapshot of handlers ──► f(&event) …
//! ```
//!
//! Emission works on a snapshot of the handler list, so a handler may
//! subscribe, unsubscribe, or trigger further emissions on other emitters
//! without tripping a `RefCell` borrow.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

type Handler<E> = Rc<RefCell<dyn FnMut(&E)>>;

struct Registry<E> {
    handlers: RefCell<Vec<(u64, Handler<E>)>>,
    next_id: Cell<u64>,
}

/// A list of handlers invoked synchronously on [`Emitter::emit`].
pub struct Emitter<E> {
    registry: Rc<Registry<E>>,
}

impl<E: 'static> Emitter<E> {
    pub fn new() -> Self {
        Self {
            registry: Rc::new(Registry {
                handlers: RefCell::new(Vec::new()),
                next_id: Cell::new(0),
            }),
        }
    }

    /// Register a handler. The handler stays registered while the returned
    /// subscription is alive.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: FnMut(&E) + 'static,
    {
        let id = self.registry.next_id.get();
        self.registry.next_id.set(id + 1);

        let handler: Handler<E> = Rc::new(RefCell::new(handler));
        self.registry.handlers.borrow_mut().push((id, handler));

        let weak: Weak<Registry<E>> = Rc::downgrade(&self.registry);
        Subscription::new(move || {
            if let Some(registry) = weak.upgrade() {
                registry.handlers.borrow_mut().retain(|(h, _)| *h != id);
            }
        })
    }

    /// Invoke every registered handler with `event`.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Handler<E>> = self
            .registry
            .handlers
            .borrow()
            .iter()
            .map(|(_, h)| h.clone())
            .collect();

        for handler in snapshot {
            match handler.try_borrow_mut() {
                Ok(mut f) => (&mut *f)(event),
                // The handler is already running further up the stack.
                Err(_) => log::warn!("Skipping re-entrant event handler"),
            }
        }
    }

    /// Number of live handlers.
    pub fn len(&self) -> usize {
        self.registry.handlers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every handler. Outstanding subscriptions become inert.
    pub fn clear(&self) {
        self.registry.handlers.borrow_mut().clear();
    }
}

/// Clones share the same handler list.
impl<E> Clone for Emitter<E> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<E: 'static> Default for Emitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for Emitter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("handlers", &self.registry.handlers.borrow().len())
            .finish()
    }
}

/// Disposer returned by every `subscribe`/`on_*` call.
///
/// The handler is removed when the subscription is dropped. Call
/// [`Subscription::detach`] to keep it registered for the emitter's lifetime.
#[must_use = "dropping a Subscription immediately removes its handler"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription that owns nothing.
    pub fn empty() -> Self {
        Self { cancel: None }
    }

    /// Remove the handler now.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the handler registered for as long as the emitter lives.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
