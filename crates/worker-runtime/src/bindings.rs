//! Host capability APIs installed onto a managed environment's process object.

use std::{
    collections::BTreeMap,
    fmt,
    rc::Rc,
    time::{SystemTime, UNIX_EPOCH},
};

use futures::future::LocalBoxFuture;
use serde_json::{Value, json};
use tracing::{Level, debug, event, level_filters::LevelFilter};

use crate::{
    TRACE_TARGET_LIFECYCLE, TRACE_TARGET_SCRIPT,
    engine::IsolateId,
    error::{BoxError, Error, Result},
    event_loop::LoopHandle,
    process::{Binding, ProcessObject},
};

pub type SyncCapability = Rc<dyn Fn(&[Value]) -> core::result::Result<Value, BoxError>>;

pub type AsyncCapability =
    Rc<dyn Fn(Vec<Value>) -> LocalBoxFuture<'static, core::result::Result<Value, BoxError>>>;

const BUILTIN_NAMES: [&str; 3] = ["versions", "getCreationTime", "log"];

#[derive(Clone)]
pub enum Capability {
    Sync(SyncCapability),
    Async(AsyncCapability),
}

/// Embedder-supplied capabilities, keyed by the name scripts see.
#[derive(Clone, Default)]
pub struct Capabilities {
    entries: BTreeMap<String, Capability>,
}

impl Capabilities {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn sync(
        mut self,
        name: impl Into<String>,
        capability: impl Fn(&[Value]) -> core::result::Result<Value, BoxError> + 'static,
    ) -> Self {
        self.entries
            .insert(name.into(), Capability::Sync(Rc::new(capability)));
        self
    }

    #[must_use]
    pub fn async_fn(
        mut self,
        name: impl Into<String>,
        capability: impl Fn(Vec<Value>) -> LocalBoxFuture<'static, core::result::Result<Value, BoxError>>
        + 'static,
    ) -> Self {
        self.entries
            .insert(name.into(), Capability::Async(Rc::new(capability)));
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

pub struct ExtensionBindings {
    loop_handle: LoopHandle,
    capabilities: Capabilities,
    log_level: LevelFilter,
    created_at: SystemTime,
}

impl ExtensionBindings {
    /// Bindings attached to `loop_handle`; async capabilities resolve there.
    #[must_use]
    pub fn create(loop_handle: LoopHandle) -> Self {
        Self {
            loop_handle,
            capabilities: Capabilities::default(),
            log_level: LevelFilter::OFF,
            created_at: SystemTime::now(),
        }
    }

    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Verbosity of the `log` capability. `OFF` drops script logs.
    #[must_use]
    pub fn with_log_level(mut self, log_level: LevelFilter) -> Self {
        self.log_level = log_level;
        self
    }

    #[must_use]
    pub const fn loop_handle(&self) -> &LoopHandle {
        &self.loop_handle
    }

    /// Install the built-in and embedder capabilities onto `process`.
    ///
    /// # Errors
    /// Returns [`Error::Binding`] if an embedder capability shadows a built-in
    /// or if `process` already defines one of the names.
    pub fn bind_to(&self, isolate: IsolateId, process: &ProcessObject) -> Result<()> {
        if let Some(name) = self
            .capabilities
            .entries
            .keys()
            .find(|name| BUILTIN_NAMES.contains(&name.as_str()))
        {
            return Err(Error::binding(name.clone(), "shadows a built-in capability"));
        }

        process.define(
            "versions",
            Binding::Value(json!({ "worker_runtime": env!("CARGO_PKG_VERSION") })),
        )?;

        let created_ms = self
            .created_at
            .duration_since(UNIX_EPOCH)
            .map_or(0.0, |d| d.as_secs_f64() * 1000.0);
        process.define(
            "getCreationTime",
            Binding::Function(Rc::new(
                move |_: &[Value]| -> core::result::Result<Value, BoxError> {
                    Ok(json!(created_ms))
                },
            )),
        )?;

        let log_level = self.log_level;
        process.define(
            "log",
            Binding::Function(Rc::new(
                move |args: &[Value]| -> core::result::Result<Value, BoxError> {
                    script_log(log_level, isolate, args);
                    Ok(Value::Null)
                },
            )),
        )?;

        for (name, capability) in &self.capabilities.entries {
            let binding = match capability {
                Capability::Sync(f) => Binding::Function(Rc::clone(f)),
                Capability::Async(f) => {
                    Binding::AsyncFunction(Rc::clone(f), self.loop_handle.clone())
                }
            };
            process.define(name.clone(), binding)?;
        }

        debug!(
            target: TRACE_TARGET_LIFECYCLE,
            isolate = isolate.0,
            capabilities = self.capabilities.len() + BUILTIN_NAMES.len(),
            "extension bindings installed"
        );
        Ok(())
    }
}

fn script_log(filter: LevelFilter, isolate: IsolateId, args: &[Value]) {
    let (level, message) = match args {
        [Value::String(first), rest @ ..] => parse_level(first).map_or_else(
            || (Level::INFO, join_args(args)),
            |level| (level, join_args(rest)),
        ),
        _ => (Level::INFO, join_args(args)),
    };
    if level > filter {
        return;
    }
    match level {
        Level::ERROR => event!(target: TRACE_TARGET_SCRIPT, Level::ERROR, isolate = isolate.0, "{message}"),
        Level::WARN => event!(target: TRACE_TARGET_SCRIPT, Level::WARN, isolate = isolate.0, "{message}"),
        Level::INFO => event!(target: TRACE_TARGET_SCRIPT, Level::INFO, isolate = isolate.0, "{message}"),
        Level::DEBUG => event!(target: TRACE_TARGET_SCRIPT, Level::DEBUG, isolate = isolate.0, "{message}"),
        _ => event!(target: TRACE_TARGET_SCRIPT, Level::TRACE, isolate = isolate.0, "{message}"),
    }
}

fn parse_level(level: &str) -> Option<Level> {
    match level {
        "error" => Some(Level::ERROR),
        "warn" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

fn join_args(args: &[Value]) -> String {
    args.iter()
        .map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
