//! Runtime environment host.
//!
//! [`EnvironmentHost`] wraps the managed runtime collaborator together with the
//! I/O loop it runs on, and remembers the single environment currently bound
//! to this thread.

use std::{cell::RefCell, fmt, rc::Rc, sync::Arc};

use tracing::{debug, level_filters::LevelFilter};

use crate::{
    TRACE_TARGET_LIFECYCLE,
    engine::{ContextId, EngineWaker, IsolateId, ScriptContext},
    error::{BoxError, Error, Result},
    event_loop::{DEFAULT_MAX_REMOTE_PER_PUMP, IoLoop, LoopHandle, PumpStats},
    process::ProcessObject,
};

/// A script context after the managed runtime accepted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeContext {
    context: ContextId,
    isolate: IsolateId,
}

impl RuntimeContext {
    #[must_use]
    pub const fn new(context: ContextId, isolate: IsolateId) -> Self {
        Self { context, isolate }
    }

    #[must_use]
    pub const fn context(&self) -> ContextId {
        self.context
    }

    #[must_use]
    pub const fn isolate(&self) -> IsolateId {
        self.isolate
    }
}

pub trait ManagedEnvironment {
    fn isolate(&self) -> IsolateId;

    fn process_object(&self) -> &Rc<ProcessObject>;
}

/// The managed runtime collaborator.
///
/// Implementations receive a [`LoopHandle`] for any loop interaction; they
/// must not call back into the owning observer while one of these methods is
/// running.
pub trait ManagedRuntime {
    /// Prepare `context` for the managed runtime. `None` means the engine and
    /// runtime disagree about the context, which the observer treats as fatal.
    fn initialize_context(&mut self, context: &dyn ScriptContext) -> Option<RuntimeContext>;

    fn create_environment(
        &mut self,
        context: &RuntimeContext,
        loop_handle: &LoopHandle,
    ) -> core::result::Result<Box<dyn ManagedEnvironment>, BoxError>;

    /// Run the environment's bootstrap (module graph and startup scripts).
    fn load_environment(
        &mut self,
        environment: &mut dyn ManagedEnvironment,
        loop_handle: &LoopHandle,
    ) -> core::result::Result<(), BoxError>;

    /// Called after every pump cycle.
    fn perform_microtask_checkpoint(&mut self) {}

    /// Release an environment. Skipped when the host tears down while this
    /// runtime is already borrowed further up the stack; the environment is
    /// then dropped directly.
    fn free_environment(&mut self, environment: Box<dyn ManagedEnvironment>) {
        drop(environment);
    }
}

/// Per-host options.
#[derive(Clone, Copy, Debug)]
pub struct HostOptions {
    pub log_level: LevelFilter,
    pub max_remote_per_pump: usize,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            log_level: LevelFilter::OFF,
            max_remote_per_pump: DEFAULT_MAX_REMOTE_PER_PUMP,
        }
    }
}

impl HostOptions {
    #[must_use]
    pub const fn log_level(mut self, log_level: LevelFilter) -> Self {
        self.log_level = log_level;
        self
    }

    #[must_use]
    pub const fn max_remote_per_pump(mut self, max_remote_per_pump: usize) -> Self {
        self.max_remote_per_pump = max_remote_per_pump;
        self
    }
}

struct CurrentEnvironment {
    context: ContextId,
    environment: Box<dyn ManagedEnvironment>,
}

pub struct EnvironmentHost {
    options: HostOptions,
    runtime: RefCell<Box<dyn ManagedRuntime>>,
    current: RefCell<Option<CurrentEnvironment>>,
    io_loop: IoLoop,
}

impl EnvironmentHost {
    #[must_use]
    pub fn create(runtime: Box<dyn ManagedRuntime>, options: HostOptions) -> Self {
        Self {
            options,
            runtime: RefCell::new(runtime),
            current: RefCell::new(None),
            io_loop: IoLoop::new(options.max_remote_per_pump),
        }
    }

    #[must_use]
    pub const fn options(&self) -> &HostOptions {
        &self.options
    }

    #[must_use]
    pub fn loop_handle(&self) -> LoopHandle {
        self.io_loop.handle()
    }

    /// Bridge the I/O loop to the engine's loop.
    ///
    /// Must run before [`EnvironmentHost::create_environment`]; until then no
    /// remote work can be routed to this thread. Calling it again is a no-op.
    pub fn prepare_message_loop(&self, waker: Arc<dyn EngineWaker>) {
        if self.io_loop.prepare(waker) {
            debug!(target: TRACE_TARGET_LIFECYCLE, "message loop bridge prepared");
        }
    }

    #[must_use]
    pub fn is_message_loop_prepared(&self) -> bool {
        self.io_loop.is_prepared()
    }

    pub fn initialize_context(&self, context: &dyn ScriptContext) -> Option<RuntimeContext> {
        self.runtime.borrow_mut().initialize_context(context)
    }

    /// # Errors
    /// Returns [`Error::LoopNotPrepared`] if the bridge is missing and
    /// [`Error::Runtime`] if the runtime fails to create the environment.
    pub fn create_environment(
        &self,
        context: &RuntimeContext,
    ) -> Result<Box<dyn ManagedEnvironment>> {
        if !self.io_loop.is_prepared() {
            return Err(Error::LoopNotPrepared);
        }
        let loop_handle = self.io_loop.handle();
        self.runtime
            .borrow_mut()
            .create_environment(context, &loop_handle)
            .map_err(Error::Runtime)
    }

    /// # Errors
    /// Returns [`Error::Runtime`] if bootstrap fails.
    pub fn load_environment(&self, environment: &mut dyn ManagedEnvironment) -> Result<()> {
        let loop_handle = self.io_loop.handle();
        self.runtime
            .borrow_mut()
            .load_environment(environment, &loop_handle)
            .map_err(Error::Runtime)
    }

    /// Bind `environment` to `context` as this thread's current environment.
    /// Returns the environment it replaced, if any.
    pub fn set_current_environment(
        &self,
        context: ContextId,
        environment: Box<dyn ManagedEnvironment>,
    ) -> Option<(ContextId, Box<dyn ManagedEnvironment>)> {
        self.current
            .borrow_mut()
            .replace(CurrentEnvironment {
                context,
                environment,
            })
            .map(|previous| (previous.context, previous.environment))
    }

    #[must_use]
    pub fn current_context(&self) -> Option<ContextId> {
        self.current.borrow().as_ref().map(|current| current.context)
    }

    #[must_use]
    pub fn has_current_environment(&self) -> bool {
        self.current.borrow().is_some()
    }

    /// Run `f` against the current environment.
    ///
    /// `f` must not call back into this host.
    pub fn with_current_environment<T>(
        &self,
        f: impl FnOnce(ContextId, &dyn ManagedEnvironment) -> T,
    ) -> Option<T> {
        self.current
            .borrow()
            .as_ref()
            .map(|current| f(current.context, current.environment.as_ref()))
    }

    /// The process object of the environment bound to `context`, if any.
    #[must_use]
    pub fn process_object_for(&self, context: ContextId) -> Option<Rc<ProcessObject>> {
        self.current
            .borrow()
            .as_ref()
            .filter(|current| current.context == context)
            .map(|current| Rc::clone(current.environment.process_object()))
    }

    pub fn take_current_environment(&self) -> Option<(ContextId, Box<dyn ManagedEnvironment>)> {
        self.current
            .borrow_mut()
            .take()
            .map(|current| (current.context, current.environment))
    }

    /// One pump cycle followed by a microtask checkpoint. Never blocks.
    ///
    /// Does nothing once the loop is closed.
    pub fn run_message_loop(&self) -> PumpStats {
        if self.io_loop.is_closed() {
            return PumpStats::default();
        }
        let stats = self.io_loop.run_once();
        if stats.nested {
            return stats;
        }
        // Skipped when the runtime is busy further up the stack; that caller
        // reaches its own checkpoint.
        if let Ok(mut runtime) = self.runtime.try_borrow_mut() {
            runtime.perform_microtask_checkpoint();
        }
        stats
    }

    pub fn free_environment(&self, environment: Box<dyn ManagedEnvironment>) {
        match self.runtime.try_borrow_mut() {
            Ok(mut runtime) => runtime.free_environment(environment),
            Err(_) => {
                debug!(
                    target: TRACE_TARGET_LIFECYCLE,
                    isolate = environment.isolate().0,
                    "runtime busy; dropping environment without free hook"
                );
                drop(environment);
            }
        }
    }

    /// Close the I/O loop. Queued work is dropped and later pumps do nothing.
    pub fn close_message_loop(&self) {
        self.io_loop.close();
    }

    #[must_use]
    pub fn is_message_loop_closed(&self) -> bool {
        self.io_loop.is_closed()
    }
}

impl Drop for EnvironmentHost {
    fn drop(&mut self) {
        if let Some((context, environment)) = self.take_current_environment() {
            debug!(target: TRACE_TARGET_LIFECYCLE, %context, "freeing environment on host drop");
            self.free_environment(environment);
        }
    }
}

impl fmt::Debug for EnvironmentHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvironmentHost")
            .field("options", &self.options)
            .field("current_context", &self.current_context())
            .field("loop", &self.io_loop.handle())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::engine::noop_waker;

    struct StubContext(u64);

    impl ScriptContext for StubContext {
        fn id(&self) -> ContextId {
            ContextId(self.0)
        }

        fn isolate(&self) -> IsolateId {
            IsolateId(1)
        }

        fn enter(&self) {}

        fn exit(&self) {}
    }

    struct StubEnvironment {
        process: Rc<ProcessObject>,
    }

    impl ManagedEnvironment for StubEnvironment {
        fn isolate(&self) -> IsolateId {
            IsolateId(1)
        }

        fn process_object(&self) -> &Rc<ProcessObject> {
            &self.process
        }
    }

    #[derive(Default)]
    struct StubRuntime {
        checkpoints: Rc<Cell<usize>>,
        freed: Rc<Cell<usize>>,
    }

    impl ManagedRuntime for StubRuntime {
        fn initialize_context(&mut self, context: &dyn ScriptContext) -> Option<RuntimeContext> {
            Some(RuntimeContext::new(context.id(), context.isolate()))
        }

        fn create_environment(
            &mut self,
            _context: &RuntimeContext,
            _loop_handle: &LoopHandle,
        ) -> core::result::Result<Box<dyn ManagedEnvironment>, BoxError> {
            Ok(Box::new(StubEnvironment {
                process: Rc::new(ProcessObject::new()),
            }))
        }

        fn load_environment(
            &mut self,
            _environment: &mut dyn ManagedEnvironment,
            _loop_handle: &LoopHandle,
        ) -> core::result::Result<(), BoxError> {
            Ok(())
        }

        fn perform_microtask_checkpoint(&mut self) {
            self.checkpoints.set(self.checkpoints.get() + 1);
        }

        fn free_environment(&mut self, environment: Box<dyn ManagedEnvironment>) {
            self.freed.set(self.freed.get() + 1);
            drop(environment);
        }
    }

    fn host_with(runtime: StubRuntime) -> EnvironmentHost {
        EnvironmentHost::create(Box::new(runtime), HostOptions::default())
    }

    #[test]
    fn create_environment_requires_prepared_loop() {
        let host = host_with(StubRuntime::default());
        let context = host
            .initialize_context(&StubContext(3))
            .expect("runtime context");

        assert!(matches!(
            host.create_environment(&context),
            Err(Error::LoopNotPrepared)
        ));

        host.prepare_message_loop(noop_waker());
        assert!(host.create_environment(&context).is_ok());
    }

    #[test]
    fn current_environment_is_keyed_by_context() {
        let host = host_with(StubRuntime::default());
        host.prepare_message_loop(noop_waker());
        let context = host
            .initialize_context(&StubContext(9))
            .expect("runtime context");
        let environment = host.create_environment(&context).expect("environment");

        assert!(host.set_current_environment(ContextId(9), environment).is_none());
        assert_eq!(host.current_context(), Some(ContextId(9)));
        assert!(host.process_object_for(ContextId(9)).is_some());
        assert!(host.process_object_for(ContextId(10)).is_none());
        assert_eq!(
            host.with_current_environment(|context, env| (context, env.isolate())),
            Some((ContextId(9), IsolateId(1)))
        );
    }

    #[test]
    fn pump_runs_microtask_checkpoint() {
        let runtime = StubRuntime::default();
        let checkpoints = Rc::clone(&runtime.checkpoints);
        let host = host_with(runtime);

        host.run_message_loop();
        host.run_message_loop();
        assert_eq!(checkpoints.get(), 2);
    }

    #[test]
    fn closed_loop_skips_checkpoint() {
        let runtime = StubRuntime::default();
        let checkpoints = Rc::clone(&runtime.checkpoints);
        let host = host_with(runtime);
        host.prepare_message_loop(noop_waker());

        host.close_message_loop();
        assert!(host.is_message_loop_closed());
        assert_eq!(host.run_message_loop(), PumpStats::default());
        assert_eq!(checkpoints.get(), 0);
        assert!(matches!(
            host.loop_handle().remote_sender(),
            Err(Error::LoopClosed)
        ));
    }

    #[test]
    fn free_while_runtime_busy_drops_environment() {
        let runtime = StubRuntime::default();
        let freed = Rc::clone(&runtime.freed);
        let host = host_with(runtime);
        let process = Rc::new(ProcessObject::new());
        let environment = Box::new(StubEnvironment {
            process: Rc::clone(&process),
        });

        let busy = host.runtime.borrow_mut();
        host.free_environment(environment);
        drop(busy);

        assert_eq!(freed.get(), 0);
        assert_eq!(Rc::strong_count(&process), 1);
    }

    #[test]
    fn dropping_host_frees_current_environment() {
        let runtime = StubRuntime::default();
        let freed = Rc::clone(&runtime.freed);
        let host = host_with(runtime);
        host.prepare_message_loop(noop_waker());
        let context = host
            .initialize_context(&StubContext(1))
            .expect("runtime context");
        let environment = host.create_environment(&context).expect("environment");
        host.set_current_environment(ContextId(1), environment);

        drop(host);
        assert_eq!(freed.get(), 1);
    }
}
