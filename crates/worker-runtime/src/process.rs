//! The process-like object exposed by a managed environment.
//!
//! It carries lifecycle event listeners registered by scripts and the
//! capability bindings installed by [`ExtensionBindings`](crate::bindings::ExtensionBindings).

use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, HashMap},
    fmt,
    rc::Rc,
};

use serde_json::Value;
use tracing::warn;

use crate::{
    TRACE_TARGET_LIFECYCLE,
    bindings::{AsyncCapability, SyncCapability},
    error::{BoxError, Error, Result},
    event_loop::LoopHandle,
};

/// Event emitted right before the environment's context is destroyed.
pub const EXIT_EVENT: &str = "exit";

pub type Listener = Rc<dyn Fn(&[Value]) -> core::result::Result<(), BoxError>>;

/// Identifies a registered listener for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct ListenerEntry {
    id: ListenerId,
    once: bool,
    callback: Listener,
}

/// A value installed on the process object.
#[derive(Clone)]
pub enum Binding {
    Value(Value),
    Function(SyncCapability),
    /// Resolved on the given loop by [`ProcessObject::call_async`].
    AsyncFunction(AsyncCapability, LoopHandle),
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Binding::Value").field(value).finish(),
            Self::Function(..) => f.write_str("Binding::Function(<fn>)"),
            Self::AsyncFunction(..) => f.write_str("Binding::AsyncFunction(<fn>)"),
        }
    }
}

#[derive(Default)]
pub struct ProcessObject {
    listeners: RefCell<HashMap<String, Vec<ListenerEntry>>>,
    bindings: RefCell<BTreeMap<String, Binding>>,
    next_listener: Cell<u64>,
}

impl ProcessObject {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(
        &self,
        event: impl Into<String>,
        listener: impl Fn(&[Value]) -> core::result::Result<(), BoxError> + 'static,
    ) -> ListenerId {
        self.add_listener(event.into(), false, Rc::new(listener))
    }

    /// Register a listener that is removed after its first invocation.
    pub fn once(
        &self,
        event: impl Into<String>,
        listener: impl Fn(&[Value]) -> core::result::Result<(), BoxError> + 'static,
    ) -> ListenerId {
        self.add_listener(event.into(), true, Rc::new(listener))
    }

    pub fn remove_listener(&self, event: &str, id: ListenerId) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let Some(entries) = listeners.get_mut(event) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            listeners.remove(event);
        }
        removed
    }

    pub fn remove_all_listeners(&self, event: &str) -> usize {
        self.listeners
            .borrow_mut()
            .remove(event)
            .map_or(0, |entries| entries.len())
    }

    #[must_use]
    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.borrow().get(event).map_or(0, Vec::len)
    }

    /// Invoke every listener registered for `event`, in registration order.
    ///
    /// Listeners registered during the emit are not called for it. A listener
    /// error is logged and does not stop the remaining listeners. Returns the
    /// number of listeners invoked.
    pub fn emit(&self, event: &str, args: &[Value]) -> usize {
        let snapshot: Vec<Listener> = {
            let mut listeners = self.listeners.borrow_mut();
            let Some(entries) = listeners.get_mut(event) else {
                return 0;
            };
            let snapshot = entries
                .iter()
                .map(|entry| Rc::clone(&entry.callback))
                .collect();
            entries.retain(|entry| !entry.once);
            if entries.is_empty() {
                listeners.remove(event);
            }
            snapshot
        };

        for listener in &snapshot {
            if let Err(err) = listener(args) {
                warn!(target: TRACE_TARGET_LIFECYCLE, event, error = %err, "listener failed");
            }
        }
        snapshot.len()
    }

    /// Install a binding. Existing bindings are never replaced.
    ///
    /// # Errors
    /// Returns [`Error::Binding`] if `name` is already bound.
    pub fn define(&self, name: impl Into<String>, binding: Binding) -> Result<()> {
        let name = name.into();
        let mut bindings = self.bindings.borrow_mut();
        if bindings.contains_key(&name) {
            return Err(Error::binding(name, "already defined on process object"));
        }
        bindings.insert(name, binding);
        Ok(())
    }

    #[must_use]
    pub fn binding(&self, name: &str) -> Option<Binding> {
        self.bindings.borrow().get(name).cloned()
    }

    #[must_use]
    pub fn has_binding(&self, name: &str) -> bool {
        self.bindings.borrow().contains_key(name)
    }

    #[must_use]
    pub fn binding_names(&self) -> Vec<String> {
        self.bindings.borrow().keys().cloned().collect()
    }

    /// Call a synchronous capability, or read a value binding.
    ///
    /// # Errors
    /// Returns [`Error::UnknownCapability`] for missing or async-only names and
    /// [`Error::Binding`] if the capability fails.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value> {
        match self.binding(name) {
            Some(Binding::Value(value)) => Ok(value),
            Some(Binding::Function(capability)) => {
                capability(args).map_err(|source| Error::binding(name, source))
            }
            Some(Binding::AsyncFunction(..)) | None => {
                Err(Error::UnknownCapability(name.to_string()))
            }
        }
    }

    /// Start an async capability; `done` runs on the loop once it resolves.
    ///
    /// # Errors
    /// Returns [`Error::UnknownCapability`] if `name` is not an async
    /// capability and [`Error::LoopClosed`] if its loop has shut down.
    pub fn call_async(
        &self,
        name: &str,
        args: Vec<Value>,
        done: impl FnOnce(core::result::Result<Value, BoxError>) + 'static,
    ) -> Result<()> {
        let Some(Binding::AsyncFunction(capability, loop_handle)) = self.binding(name) else {
            return Err(Error::UnknownCapability(name.to_string()));
        };
        let pending = capability(args);
        loop_handle.spawn_local(async move { done(pending.await) })
    }

    fn add_listener(&self, event: String, once: bool, callback: Listener) -> ListenerId {
        let id = ListenerId(self.next_listener.get());
        self.next_listener.set(id.0 + 1);
        self.listeners
            .borrow_mut()
            .entry(event)
            .or_default()
            .push(ListenerEntry { id, once, callback });
        id
    }
}

impl fmt::Debug for ProcessObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners: BTreeMap<String, usize> = self
            .listeners
            .borrow()
            .iter()
            .map(|(event, entries)| (event.clone(), entries.len()))
            .collect();
        f.debug_struct("ProcessObject")
            .field("listeners", &listeners)
            .field("bindings", &self.binding_names())
            .finish_non_exhaustive()
    }
}
