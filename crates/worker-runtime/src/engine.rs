//! Script-engine side of the boundary.
//!
//! The engine owns its contexts; this crate only sees them through
//! [`ScriptContext`] while a lifecycle signal is being handled.

use std::{fmt, sync::Arc};

/// Opaque identifier of an engine-owned script context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "context#{}", self.0)
    }
}

/// Identifier of the engine isolate a context lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IsolateId(pub u64);

pub trait ScriptContext {
    fn id(&self) -> ContextId;

    fn isolate(&self) -> IsolateId;

    /// Make this context the engine's current execution scope.
    fn enter(&self);

    /// Leave the scope entered by [`ScriptContext::enter`].
    fn exit(&self);
}

/// Keeps a context entered until dropped.
pub struct ContextScope<'a> {
    context: &'a dyn ScriptContext,
}

impl<'a> ContextScope<'a> {
    #[must_use]
    pub fn enter(context: &'a dyn ScriptContext) -> Self {
        context.enter();
        Self { context }
    }
}

impl Drop for ContextScope<'_> {
    fn drop(&mut self) {
        self.context.exit();
    }
}

/// Schedules a pump on the script engine's own message loop.
///
/// Called from arbitrary threads whenever work is posted to the I/O loop
/// through a [`RemoteSender`](crate::event_loop::RemoteSender). The engine is
/// expected to answer with a later call to
/// [`EnvironmentHost::run_message_loop`](crate::environment::EnvironmentHost::run_message_loop)
/// on the worker thread.
pub trait EngineWaker: Send + Sync + 'static {
    fn wake(&self);
}

impl<F> EngineWaker for F
where
    F: Fn() + Send + Sync + 'static,
{
    fn wake(&self) {
        self();
    }
}

/// Waker for embedders that pump on their own schedule.
#[must_use]
pub fn noop_waker() -> Arc<dyn EngineWaker> {
    Arc::new(|| {})
}
