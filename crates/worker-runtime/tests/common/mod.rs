#![allow(dead_code)]

use std::{
    cell::Cell,
    rc::Rc,
    sync::{Arc, Once},
    thread::ThreadId,
};

use parking_lot::Mutex;
use tracing::level_filters::LevelFilter;
use worker_runtime::{
    ArchiveCache, BoxError, ContextId, HostOptions, IsolateId, LoopHandle, ManagedEnvironment,
    ManagedRuntime, ObserverConfig, ProcessObject, RuntimeContext, ScriptContext, registry,
};

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(LevelFilter::TRACE)
            .try_init();
    });
}

/// Run `f` on a fresh thread so its observer never leaks into another test.
pub fn on_worker_thread<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    init_tracing();
    match std::thread::spawn(f).join() {
        Ok(value) => value,
        Err(payload) => std::panic::resume_unwind(payload),
    }
}

/// Ordered record of collaborator calls, shared across threads.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().iter().filter(|e| *e == entry).count()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e == entry)
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.position(entry).is_some()
    }
}

pub struct TestContext {
    id: ContextId,
    depth: Cell<u32>,
    journal: Journal,
}

impl TestContext {
    pub fn new(id: u64, journal: &Journal) -> Self {
        Self {
            id: ContextId(id),
            depth: Cell::new(0),
            journal: journal.clone(),
        }
    }

    pub fn depth(&self) -> u32 {
        self.depth.get()
    }
}

impl ScriptContext for TestContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn isolate(&self) -> IsolateId {
        IsolateId(1)
    }

    fn enter(&self) {
        self.depth.set(self.depth.get() + 1);
        self.journal.record("context enter");
    }

    fn exit(&self) {
        self.depth.set(self.depth.get() - 1);
        self.journal.record("context exit");
    }
}

pub struct TestEnvironment {
    isolate: IsolateId,
    process: Rc<ProcessObject>,
}

impl ManagedEnvironment for TestEnvironment {
    fn isolate(&self) -> IsolateId {
        self.isolate
    }

    fn process_object(&self) -> &Rc<ProcessObject> {
        &self.process
    }
}

/// Script bootstrap run by [`TestRuntime::load_environment`].
pub type Bootstrap = Arc<dyn Fn(&LoopHandle, &Rc<ProcessObject>) + Send + Sync>;

#[derive(Clone, Default)]
pub struct TestRuntime {
    journal: Journal,
    reject_context: bool,
    fail_load: bool,
    bootstrap: Option<Bootstrap>,
}

impl TestRuntime {
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn reject_context(mut self) -> Self {
        self.reject_context = true;
        self
    }

    #[must_use]
    pub fn fail_load(mut self) -> Self {
        self.fail_load = true;
        self
    }

    #[must_use]
    pub fn bootstrap(
        mut self,
        bootstrap: impl Fn(&LoopHandle, &Rc<ProcessObject>) + Send + Sync + 'static,
    ) -> Self {
        self.bootstrap = Some(Arc::new(bootstrap));
        self
    }

    pub fn into_config(self) -> ObserverConfig {
        let archives = Arc::new(RecordingArchives(self.journal.clone()));
        ObserverConfig::new(self)
            .host_options(HostOptions::default().log_level(LevelFilter::DEBUG))
            .archives(archives)
    }
}

impl ManagedRuntime for TestRuntime {
    fn initialize_context(&mut self, context: &dyn ScriptContext) -> Option<RuntimeContext> {
        self.journal.record(format!("initialize {}", context.id()));
        (!self.reject_context).then(|| RuntimeContext::new(context.id(), context.isolate()))
    }

    fn create_environment(
        &mut self,
        context: &RuntimeContext,
        loop_handle: &LoopHandle,
    ) -> Result<Box<dyn ManagedEnvironment>, BoxError> {
        self.journal
            .record(format!("create prepared={}", loop_handle.is_prepared()));
        Ok(Box::new(TestEnvironment {
            isolate: context.isolate(),
            process: Rc::new(ProcessObject::new()),
        }))
    }

    fn load_environment(
        &mut self,
        environment: &mut dyn ManagedEnvironment,
        loop_handle: &LoopHandle,
    ) -> Result<(), BoxError> {
        let process = environment.process_object();
        self.journal
            .record(format!("load bound={}", process.has_binding("versions")));
        if let Some(bootstrap) = &self.bootstrap {
            bootstrap(loop_handle, process);
        }
        if self.fail_load {
            return Err("bootstrap script threw".into());
        }
        Ok(())
    }

    fn perform_microtask_checkpoint(&mut self) {
        self.journal.record("checkpoint");
    }

    fn free_environment(&mut self, environment: Box<dyn ManagedEnvironment>) {
        self.journal
            .record(format!("free registered={}", registry::is_registered()));
        drop(environment);
    }
}

pub struct RecordingArchives(Journal);

impl ArchiveCache for RecordingArchives {
    fn clear_archives(&self, _thread: ThreadId) -> usize {
        self.0
            .record(format!("clear_archives registered={}", registry::is_registered()));
        0
    }
}
