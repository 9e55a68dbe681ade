use std::thread::ThreadId;

use thiserror::Error;

use crate::engine::ContextId;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// The loop bridge was used before `prepare_message_loop`.
    #[error("message loop bridge is not prepared")]
    LoopNotPrepared,

    /// The I/O loop behind a handle or remote sender has shut down.
    #[error("message loop is closed")]
    LoopClosed,

    /// Another observer already owns the calling thread.
    #[error("a worker observer is already registered on {0:?}")]
    AlreadyRegistered(ThreadId),

    /// A second `context_created` signal arrived for a bound observer.
    #[error("worker observer is already bound to {0}")]
    AlreadyBound(ContextId),

    /// A lifecycle signal arrived after teardown.
    #[error("worker observer has been destroyed")]
    Destroyed,

    #[error("no runtime factory installed")]
    NoFactory,

    #[error("runtime factory is already installed")]
    FactoryAlreadyInstalled,

    /// Managed-runtime collaborator failed (environment creation or bootstrap).
    #[error("runtime error: {0}")]
    Runtime(#[source] BoxError),

    /// Capability installation or invocation failed.
    #[error("binding `{name}` failed: {source}")]
    Binding {
        name: String,
        #[source]
        source: BoxError,
    },

    #[error("no capability named `{0}`")]
    UnknownCapability(String),

    /// Filesystem I/O error (resource archives).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn binding(name: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Binding {
            name: name.into(),
            source: source.into(),
        }
    }
}
