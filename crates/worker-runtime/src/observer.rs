//! Worker runtime observer.
//!
//! One [`WorkerObserver`] per worker thread binds a managed environment to the
//! worker's script context. Typical flow:
//! 1. [`WorkerObserver::get_current`] (or [`WorkerObserver::new`]) before the
//!    engine signals anything.
//! 2. [`WorkerObserver::context_created`] when the worker context is ready.
//! 3. [`WorkerObserver::context_will_destroy`] right before the engine tears
//!    the context down. The observer emits `exit`, then releases itself from
//!    the thread-local registry and frees everything it owns.

use std::{
    cell::Cell,
    fmt,
    rc::Rc,
    sync::{Arc, OnceLock},
    thread::{self, ThreadId},
};

use tracing::{debug, error, info_span};

use crate::{
    TRACE_TARGET_LIFECYCLE,
    archive::{ArchiveCache, ArchiveRegistry},
    bindings::{Capabilities, ExtensionBindings},
    engine::{ContextId, ContextScope, EngineWaker, ScriptContext, noop_waker},
    environment::{EnvironmentHost, HostOptions, ManagedRuntime},
    error::{Error, Result},
    event_loop::{LoopHandle, RemoteSender},
    process::EXIT_EVENT,
    registry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverState {
    Constructed,
    ContextBound,
    Destroyed,
}

/// Everything an observer needs to construct itself on a thread.
pub struct ObserverConfig {
    pub runtime: Box<dyn ManagedRuntime>,
    pub host_options: HostOptions,
    pub capabilities: Capabilities,
    pub archives: Arc<dyn ArchiveCache>,
    pub waker: Arc<dyn EngineWaker>,
}

impl ObserverConfig {
    /// Defaults: no embedder capabilities, the global archive registry and a
    /// waker that does nothing.
    #[must_use]
    pub fn new(runtime: impl ManagedRuntime + 'static) -> Self {
        Self {
            runtime: Box::new(runtime),
            host_options: HostOptions::default(),
            capabilities: Capabilities::default(),
            archives: ArchiveRegistry::global(),
            waker: noop_waker(),
        }
    }

    #[must_use]
    pub fn host_options(mut self, host_options: HostOptions) -> Self {
        self.host_options = host_options;
        self
    }

    #[must_use]
    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn archives(mut self, archives: Arc<dyn ArchiveCache>) -> Self {
        self.archives = archives;
        self
    }

    #[must_use]
    pub fn waker(mut self, waker: Arc<dyn EngineWaker>) -> Self {
        self.waker = waker;
        self
    }
}

impl fmt::Debug for ObserverConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverConfig")
            .field("host_options", &self.host_options)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

/// Builds an [`ObserverConfig`] on the thread that needs an observer.
pub trait RuntimeFactory: Send + Sync + 'static {
    fn create(&self) -> ObserverConfig;
}

impl<F> RuntimeFactory for F
where
    F: Fn() -> ObserverConfig + Send + Sync + 'static,
{
    fn create(&self) -> ObserverConfig {
        self()
    }
}

static FACTORY: OnceLock<Box<dyn RuntimeFactory>> = OnceLock::new();

/// Install the process-wide factory used by [`WorkerObserver::get_current`].
///
/// # Errors
/// Returns [`Error::FactoryAlreadyInstalled`] on every call after the first.
pub fn install_factory(factory: impl RuntimeFactory) -> Result<()> {
    FACTORY
        .set(Box::new(factory))
        .map_err(|_| Error::FactoryAlreadyInstalled)
}

pub struct WorkerObserver {
    host: EnvironmentHost,
    bindings: ExtensionBindings,
    archives: Arc<dyn ArchiveCache>,
    waker: Arc<dyn EngineWaker>,
    state: Cell<ObserverState>,
    thread: ThreadId,
}

impl WorkerObserver {
    /// The calling thread's observer, built from the installed factory on miss.
    ///
    /// # Errors
    /// Returns [`Error::NoFactory`] if no observer exists yet and
    /// [`install_factory`] was never called.
    pub fn get_current() -> Result<Rc<Self>> {
        if let Some(observer) = registry::current() {
            return Ok(observer);
        }
        let factory = FACTORY.get().ok_or(Error::NoFactory)?;
        Self::new(factory.create())
    }

    /// Like [`WorkerObserver::get_current`] with an explicit factory.
    ///
    /// # Errors
    /// Returns [`Error::AlreadyRegistered`] only if the thread is exiting.
    pub fn get_current_with(factory: &dyn RuntimeFactory) -> Result<Rc<Self>> {
        if let Some(observer) = registry::current() {
            return Ok(observer);
        }
        Self::new(factory.create())
    }

    /// Construct an observer and register it for the calling thread.
    ///
    /// # Errors
    /// Returns [`Error::AlreadyRegistered`] if the thread already has one.
    pub fn new(config: ObserverConfig) -> Result<Rc<Self>> {
        let thread = thread::current().id();
        if registry::is_registered() {
            return Err(Error::AlreadyRegistered(thread));
        }

        let ObserverConfig {
            runtime,
            host_options,
            capabilities,
            archives,
            waker,
        } = config;

        let host = EnvironmentHost::create(runtime, host_options);
        let bindings = ExtensionBindings::create(host.loop_handle())
            .with_capabilities(capabilities)
            .with_log_level(host_options.log_level);

        let observer = Rc::new(Self {
            host,
            bindings,
            archives,
            waker,
            state: Cell::new(ObserverState::Constructed),
            thread,
        });
        if !registry::register(&observer) {
            // Never registered, so there is nothing thread-scoped to release.
            observer.state.set(ObserverState::Destroyed);
            return Err(Error::AlreadyRegistered(thread));
        }
        debug!(target: TRACE_TARGET_LIFECYCLE, ?thread, "worker observer constructed");
        Ok(observer)
    }

    /// Bind a managed environment to `context`.
    ///
    /// On error the partially built environment is freed and the observer
    /// stays [`ObserverState::Constructed`].
    ///
    /// # Errors
    /// Returns [`Error::Destroyed`] after teardown, [`Error::AlreadyBound`] if
    /// a context is already bound, and [`Error::Runtime`] or
    /// [`Error::Binding`] if the environment cannot be set up.
    ///
    /// # Panics
    /// Panics if the managed runtime rejects `context`: the engine and runtime
    /// are out of sync and no script may run on this thread.
    pub fn context_created(&self, context: &dyn ScriptContext) -> Result<()> {
        match self.state.get() {
            ObserverState::Destroyed => return Err(Error::Destroyed),
            ObserverState::ContextBound => {
                let bound = self.host.current_context().unwrap_or(context.id());
                return Err(Error::AlreadyBound(bound));
            }
            ObserverState::Constructed => {}
        }

        let id = context.id();
        let span = info_span!(target: TRACE_TARGET_LIFECYCLE, "worker.context_created", context = %id);
        let _span = span.enter();
        let _scope = ContextScope::enter(context);

        self.host.prepare_message_loop(Arc::clone(&self.waker));

        let Some(runtime_context) = self.host.initialize_context(context) else {
            fatal_invalid_context(id);
        };

        let mut environment = self.host.create_environment(&runtime_context)?;
        let setup = self
            .bindings
            .bind_to(runtime_context.isolate(), environment.process_object())
            .and_then(|()| self.host.load_environment(environment.as_mut()));
        if let Err(err) = setup {
            self.host.free_environment(environment);
            return Err(err);
        }

        let replaced = self.host.set_current_environment(id, environment);
        debug_assert!(replaced.is_none(), "bound observer accepted a second environment");
        self.state.set(ObserverState::ContextBound);

        let stats = self.host.run_message_loop();
        debug!(
            target: TRACE_TARGET_LIFECYCLE,
            remote = stats.remote,
            immediates = stats.immediates,
            "environment bound"
        );
        Ok(())
    }

    /// Notify `exit` listeners of the environment bound to `context`, then
    /// tear the observer down. Teardown happens even if nothing was bound.
    ///
    /// # Errors
    /// Returns [`Error::Destroyed`] if the observer was already torn down; the
    /// engine delivers one destroy signal per context, so this is a caller bug.
    pub fn context_will_destroy(&self, context: &dyn ScriptContext) -> Result<()> {
        if self.state.get() == ObserverState::Destroyed {
            return Err(Error::Destroyed);
        }

        let id = context.id();
        if let Some(process) = self.host.process_object_for(id) {
            let _scope = ContextScope::enter(context);
            let notified = process.emit(EXIT_EVENT, &[]);
            debug!(target: TRACE_TARGET_LIFECYCLE, context = %id, notified, "exit emitted");
        }

        self.teardown();
        Ok(())
    }

    #[must_use]
    pub fn state(&self) -> ObserverState {
        self.state.get()
    }

    #[must_use]
    pub const fn thread(&self) -> ThreadId {
        self.thread
    }

    #[must_use]
    pub const fn host(&self) -> &EnvironmentHost {
        &self.host
    }

    #[must_use]
    pub const fn bindings(&self) -> &ExtensionBindings {
        &self.bindings
    }

    #[must_use]
    pub fn loop_handle(&self) -> LoopHandle {
        self.host.loop_handle()
    }

    /// # Errors
    /// Returns [`Error::LoopNotPrepared`] before the first context is created.
    pub fn remote_sender(&self) -> Result<RemoteSender> {
        self.host.loop_handle().remote_sender()
    }

    /// Release order: thread-local slot, environment, archive cache, I/O loop.
    fn teardown(&self) {
        if self.state.replace(ObserverState::Destroyed) == ObserverState::Destroyed {
            return;
        }

        let unregistered = registry::unregister(self);
        let freed = self.host.take_current_environment().map(|(context, environment)| {
            self.host.free_environment(environment);
            context
        });
        let archives = self.archives.clear_archives(self.thread);
        self.host.close_message_loop();

        debug!(
            target: TRACE_TARGET_LIFECYCLE,
            unregistered,
            freed = ?freed,
            archives,
            "worker observer torn down"
        );
    }
}

impl Drop for WorkerObserver {
    fn drop(&mut self) {
        // Reached without a destroy signal only when the thread exits.
        self.teardown();
    }
}

impl fmt::Debug for WorkerObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerObserver")
            .field("state", &self.state.get())
            .field("thread", &self.thread)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

fn fatal_invalid_context(context: ContextId) -> ! {
    error!(
        target: TRACE_TARGET_LIFECYCLE,
        %context,
        "managed runtime rejected script context"
    );
    panic!("managed runtime rejected script context {context}; engine and runtime are out of sync");
}
