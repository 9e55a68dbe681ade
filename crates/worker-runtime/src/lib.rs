pub mod archive;
pub mod bindings;
pub mod engine;
pub mod environment;
pub mod error;
pub mod event_loop;
pub mod observer;
pub mod process;
pub mod registry;

pub const TRACE_TARGET_LIFECYCLE: &str = "worker_runtime::lifecycle";
pub const TRACE_TARGET_SCRIPT: &str = "worker_runtime::script";

pub use archive::{Archive, ArchiveCache, ArchiveRegistry};
pub use bindings::{Capabilities, Capability, ExtensionBindings};
pub use engine::{ContextId, ContextScope, EngineWaker, IsolateId, ScriptContext, noop_waker};
pub use environment::{
    EnvironmentHost, HostOptions, ManagedEnvironment, ManagedRuntime, RuntimeContext,
};
pub use error::{BoxError, Error, Result};
pub use event_loop::{DEFAULT_MAX_REMOTE_PER_PUMP, IoLoop, LoopHandle, PumpStats, RemoteSender};
pub use observer::{ObserverConfig, ObserverState, RuntimeFactory, WorkerObserver, install_factory};
pub use process::{Binding, EXIT_EVENT, ListenerId, ProcessObject};
