//! The managed runtime's I/O loop.
//!
//! The loop is confined to its worker thread. Work from other threads enters
//! through the bridge installed by [`IoLoop::prepare`]: a [`RemoteSender`]
//! queues the task and wakes the script engine, which later pumps the loop on
//! the worker thread. A pump never waits; it drains what is ready and returns.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    fmt,
    future::Future,
    rc::Rc,
    sync::Arc,
};

use futures::{
    executor::{LocalPool, LocalSpawner},
    task::LocalSpawnExt as _,
};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::{
    TRACE_TARGET_LIFECYCLE,
    engine::EngineWaker,
    error::{Error, Result},
};

/// Upper bound on remote posts drained by a single pump.
pub const DEFAULT_MAX_REMOTE_PER_PUMP: usize = 1024;

type LocalTask = Box<dyn FnOnce()>;
type RemoteTask = Box<dyn FnOnce() + Send>;

struct Bridge {
    sender: mpsc::UnboundedSender<RemoteTask>,
    receiver: mpsc::UnboundedReceiver<RemoteTask>,
    waker: Arc<dyn EngineWaker>,
}

struct LoopState {
    pool: RefCell<LocalPool>,
    spawner: LocalSpawner,
    immediates: RefCell<VecDeque<LocalTask>>,
    bridge: RefCell<Option<Bridge>>,
    pumping: Cell<bool>,
    closed: Cell<bool>,
    max_remote_per_pump: usize,
}

/// What a single pump cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub remote: usize,
    pub immediates: usize,
    /// The pump was requested from inside another pump and did nothing.
    pub nested: bool,
}

/// Owning side of the loop. Dropping it closes every handle.
pub struct IoLoop {
    state: Rc<LoopState>,
}

/// Cheap, thread-confined handle to an [`IoLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    state: Rc<LoopState>,
}

/// `Send` endpoint for posting work to the loop from any thread.
#[derive(Clone)]
pub struct RemoteSender {
    sender: mpsc::UnboundedSender<RemoteTask>,
    waker: Arc<dyn EngineWaker>,
}

struct PumpingGuard<'a>(&'a Cell<bool>);

impl Drop for PumpingGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl IoLoop {
    #[must_use]
    pub fn new(max_remote_per_pump: usize) -> Self {
        let pool = LocalPool::new();
        let spawner = pool.spawner();
        Self {
            state: Rc::new(LoopState {
                pool: RefCell::new(pool),
                spawner,
                immediates: RefCell::new(VecDeque::new()),
                bridge: RefCell::new(None),
                pumping: Cell::new(false),
                closed: Cell::new(false),
                max_remote_per_pump: max_remote_per_pump.max(1),
            }),
        }
    }

    #[must_use]
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            state: Rc::clone(&self.state),
        }
    }

    /// Install the cross-loop bridge. Returns `false` if it was already
    /// installed, in which case the first waker is kept.
    pub fn prepare(&self, waker: Arc<dyn EngineWaker>) -> bool {
        let mut bridge = self.state.bridge.borrow_mut();
        if bridge.is_some() || self.state.closed.get() {
            return false;
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        *bridge = Some(Bridge {
            sender,
            receiver,
            waker,
        });
        true
    }

    #[must_use]
    pub fn is_prepared(&self) -> bool {
        self.state.bridge.borrow().is_some()
    }

    pub fn run_once(&self) -> PumpStats {
        self.state.run_once()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.closed.get()
    }

    /// Drop queued work and the bridge. Every handle and remote sender
    /// reports [`Error::LoopClosed`] afterwards.
    pub(crate) fn close(&self) {
        if !self.state.closed.get() {
            debug!(target: TRACE_TARGET_LIFECYCLE, "message loop closed");
        }
        self.state.close();
    }
}

impl Default for IoLoop {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REMOTE_PER_PUMP)
    }
}

impl Drop for IoLoop {
    fn drop(&mut self) {
        self.state.close();
    }
}

impl LoopHandle {
    /// Queue `task` for the next pump.
    ///
    /// # Errors
    /// Returns [`Error::LoopClosed`] once the owning [`IoLoop`] is dropped.
    pub fn set_immediate(&self, task: impl FnOnce() + 'static) -> Result<()> {
        if self.state.closed.get() {
            return Err(Error::LoopClosed);
        }
        self.state.immediates.borrow_mut().push_back(Box::new(task));
        Ok(())
    }

    /// Spawn a future driven by the loop's pumps.
    ///
    /// The loop does not run a reactor; the future must be woken by something
    /// else (another task, a remote post, or a channel) to make progress.
    ///
    /// # Errors
    /// Returns [`Error::LoopClosed`] once the owning [`IoLoop`] is dropped.
    pub fn spawn_local(&self, future: impl Future<Output = ()> + 'static) -> Result<()> {
        if self.state.closed.get() {
            return Err(Error::LoopClosed);
        }
        self.state
            .spawner
            .spawn_local(future)
            .map_err(|_| Error::LoopClosed)
    }

    /// # Errors
    /// Returns [`Error::LoopNotPrepared`] before the bridge is installed and
    /// [`Error::LoopClosed`] after the loop shut down.
    pub fn remote_sender(&self) -> Result<RemoteSender> {
        if self.state.closed.get() {
            return Err(Error::LoopClosed);
        }
        self.state
            .bridge
            .borrow()
            .as_ref()
            .map(|bridge| RemoteSender {
                sender: bridge.sender.clone(),
                waker: Arc::clone(&bridge.waker),
            })
            .ok_or(Error::LoopNotPrepared)
    }

    #[must_use]
    pub fn is_prepared(&self) -> bool {
        self.state.bridge.borrow().is_some()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.closed.get()
    }

    #[must_use]
    pub fn pending_immediates(&self) -> usize {
        self.state.immediates.borrow().len()
    }

    /// Pump from inside script execution. A no-op if a pump is already running.
    pub fn run_once(&self) -> PumpStats {
        self.state.run_once()
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("prepared", &self.is_prepared())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl RemoteSender {
    /// Queue `task` on the worker thread and wake the engine loop.
    ///
    /// # Errors
    /// Returns [`Error::LoopClosed`] if the loop has shut down.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        self.sender
            .send(Box::new(task))
            .map_err(|_| Error::LoopClosed)?;
        self.waker.wake();
        Ok(())
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl fmt::Debug for RemoteSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSender")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl LoopState {
    fn run_once(&self) -> PumpStats {
        if self.closed.get() {
            return PumpStats::default();
        }
        if self.pumping.replace(true) {
            trace!(target: TRACE_TARGET_LIFECYCLE, "nested pump skipped");
            return PumpStats {
                nested: true,
                ..PumpStats::default()
            };
        }
        let _pumping = PumpingGuard(&self.pumping);

        let remote = self.drain_remote();
        let immediates = self.run_immediates();
        if let Ok(mut pool) = self.pool.try_borrow_mut() {
            pool.run_until_stalled();
        }

        PumpStats {
            remote,
            immediates,
            nested: false,
        }
    }

    fn drain_remote(&self) -> usize {
        let (tasks, rewake) = {
            let mut bridge = self.bridge.borrow_mut();
            let Some(bridge) = bridge.as_mut() else {
                return 0;
            };
            let mut tasks = Vec::new();
            while tasks.len() < self.max_remote_per_pump {
                match bridge.receiver.try_recv() {
                    Ok(task) => tasks.push(task),
                    Err(_) => break,
                }
            }
            let rewake =
                (tasks.len() == self.max_remote_per_pump).then(|| Arc::clone(&bridge.waker));
            (tasks, rewake)
        };

        let count = tasks.len();
        for task in tasks {
            task();
        }
        if let Some(waker) = rewake {
            debug!(
                target: TRACE_TARGET_LIFECYCLE,
                limit = self.max_remote_per_pump,
                "remote backlog exceeds pump budget; rescheduling"
            );
            waker.wake();
        }
        count
    }

    fn run_immediates(&self) -> usize {
        // Immediates queued while these run wait for the next pump.
        let pending = self.immediates.borrow().len();
        let mut ran = 0;
        while ran < pending {
            let Some(task) = self.immediates.borrow_mut().pop_front() else {
                break;
            };
            task();
            ran += 1;
        }
        ran
    }

    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        let immediates = std::mem::take(&mut *self.immediates.borrow_mut());
        drop(immediates);
        let bridge = self.bridge.borrow_mut().take();
        drop(bridge);
        if let Ok(mut pool) = self.pool.try_borrow_mut() {
            let old = std::mem::replace(&mut *pool, LocalPool::new());
            drop(pool);
            drop(old);
        }
    }
}
