//! Per-filesystem synchronization thread.
//!
//! The thread is a tokio task that owns its state machine. Callers talk to
//! it through a bounded channel of [`SyncMsg`] commands; requests that must
//! be observed before the caller continues (freeze, unfreeze, stop) carry a
//! oneshot acknowledgement, and the caller re-checks for it at
//! `ack_poll_interval_ms` so a stuck thread is reported rather than hung on
//! silently. The current [`SyncState`] and [`SyncThrStats`] are published on
//! watch channels.
//!
//! Replica repair itself is delegated to a [`SyncDriver`].

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use treefs_chain::Key;

use crate::config::SyncThrConfig;
use crate::error::{ClusterError, ClusterResult};

/// State of a sync thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    /// Running, waiting for work.
    Idle,
    /// A freeze request is being processed.
    FreezeRequested,
    /// Parked; performs no work until unfrozen.
    Frozen,
    /// Recomputing replica mastership.
    RemasterRequested,
    /// Shutting down.
    Stopping,
    /// Not running.
    Stopped,
}

/// Control messages understood by the sync thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMsg {
    /// Park the thread.
    Freeze,
    /// Resume a parked thread.
    Unfreeze,
    /// Recompute replica mastership.
    Remaster,
    /// Schedule the subtree at the given key for repair.
    Requeue(Key),
    /// Terminate.
    Stop,
}

/// Counters published by a sync thread.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncThrStats {
    /// Freeze requests honoured.
    pub freezes: u64,
    /// Unfreeze requests honoured.
    pub unfreezes: u64,
    /// Remaster passes run.
    pub remasters: u64,
    /// Subtrees handed to the driver for repair.
    pub resyncs: u64,
    /// Requests held back while frozen.
    pub deferred: u64,
    /// Periodic idle wakeups.
    pub idle_ticks: u64,
}

/// Work performed by a sync thread.
pub trait SyncDriver: Send + 'static {
    /// Recompute which replicas are authoritative.
    fn remaster(&mut self);

    /// Repair the subtree rooted at `key`.
    fn resync(&mut self, key: Key);

    /// Periodic wakeup while idle.
    fn idle_tick(&mut self) {}
}

/// Default driver for a primary instance; it only records what it is
/// asked to do.
#[derive(Debug, Default)]
pub struct PrimarySync {
    name: String,
}

impl PrimarySync {
    /// Creates a driver for the named instance.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl SyncDriver for PrimarySync {
    fn remaster(&mut self) {
        debug!(pfs = %self.name, "remaster");
    }

    fn resync(&mut self, key: Key) {
        debug!(pfs = %self.name, key = %format_args!("{:#x}", key), "resync requested");
    }
}

struct Command {
    msg: SyncMsg,
    ack: Option<oneshot::Sender<()>>,
}

struct Running {
    tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<SyncState>,
    stats_rx: watch::Receiver<SyncThrStats>,
    task: JoinHandle<()>,
}

/// Handle to a filesystem instance's sync thread.
pub struct SyncThr {
    name: String,
    config: SyncThrConfig,
    running: Mutex<Option<Running>>,
    last_stats: Mutex<SyncThrStats>,
}

impl std::fmt::Debug for SyncThr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncThr")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl SyncThr {
    /// Creates a handle; the thread is not started.
    pub fn new(name: &str, config: SyncThrConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            running: Mutex::new(None),
            last_stats: Mutex::new(SyncThrStats::default()),
        }
    }

    /// Thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawns the thread on the current tokio runtime.
    pub fn start<D: SyncDriver>(&self, driver: D) -> ClusterResult<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(ClusterError::SyncThrAlreadyRunning {
                name: self.name.clone(),
            });
        }
        let handle = tokio::runtime::Handle::try_current().map_err(|_| ClusterError::NoRuntime)?;
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(SyncState::Idle);
        let (stats_tx, stats_rx) = watch::channel(SyncThrStats::default());
        let worker = Worker {
            name: self.name.clone(),
            idle_interval: Duration::from_millis(self.config.idle_interval_ms),
            driver,
            rx,
            state_tx,
            stats_tx,
            stats: SyncThrStats::default(),
            frozen: false,
            remaster_pending: false,
            requeued: VecDeque::new(),
        };
        let task = handle.spawn(worker.run());
        *running = Some(Running {
            tx,
            state_rx,
            stats_rx,
            task,
        });
        info!(syncthr = %self.name, "sync thread started");
        Ok(())
    }

    /// True between `start` and `delete`.
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Current state; `Stopped` when not running.
    pub fn state(&self) -> SyncState {
        match self.running.lock().as_ref() {
            Some(r) => *r.state_rx.borrow(),
            None => SyncState::Stopped,
        }
    }

    /// Watch receiver for state changes.
    pub fn subscribe(&self) -> Option<watch::Receiver<SyncState>> {
        self.running.lock().as_ref().map(|r| r.state_rx.clone())
    }

    /// Latest published counters.
    pub fn stats(&self) -> SyncThrStats {
        match self.running.lock().as_ref() {
            Some(r) => r.stats_rx.borrow().clone(),
            None => self.last_stats.lock().clone(),
        }
    }

    fn sender(&self) -> ClusterResult<mpsc::Sender<Command>> {
        self.running
            .lock()
            .as_ref()
            .map(|r| r.tx.clone())
            .ok_or_else(|| ClusterError::SyncThrNotRunning {
                name: self.name.clone(),
            })
    }

    async fn send(&self, msg: SyncMsg, want_ack: bool) -> ClusterResult<Option<oneshot::Receiver<()>>> {
        let tx = self.sender()?;
        let (ack, rx) = if want_ack {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        tx.send(Command { msg, ack })
            .await
            .map_err(|_| ClusterError::SyncThrGone {
                name: self.name.clone(),
            })?;
        Ok(rx)
    }

    async fn wait_ack(&self, op: &'static str, mut ack: oneshot::Receiver<()>) -> ClusterResult<()> {
        let interval = Duration::from_millis(self.config.ack_poll_interval_ms.max(1));
        loop {
            match tokio::time::timeout(interval, &mut ack).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(_)) => {
                    return Err(ClusterError::SyncThrGone {
                        name: self.name.clone(),
                    })
                }
                Err(_) => warn!(syncthr = %self.name, op, "still waiting for acknowledgement"),
            }
        }
    }

    async fn request(&self, op: &'static str, msg: SyncMsg) -> ClusterResult<()> {
        if let Some(ack) = self.send(msg, true).await? {
            self.wait_ack(op, ack).await?;
        }
        Ok(())
    }

    /// Parks the thread. Returns once it reports `Frozen`.
    pub async fn freeze(&self) -> ClusterResult<()> {
        self.request("freeze", SyncMsg::Freeze).await
    }

    /// Resumes a parked thread, applying anything deferred while frozen.
    pub async fn unfreeze(&self) -> ClusterResult<()> {
        self.request("unfreeze", SyncMsg::Unfreeze).await
    }

    /// Requests a mastership recomputation.
    pub async fn remaster(&self) -> ClusterResult<()> {
        self.send(SyncMsg::Remaster, false).await.map(|_| ())
    }

    /// Schedules the subtree at `key` for repair.
    pub async fn requeue(&self, key: Key) -> ClusterResult<()> {
        self.send(SyncMsg::Requeue(key), false).await.map(|_| ())
    }

    /// Stops the thread and waits for it to exit. Safe to call repeatedly
    /// and on a thread that was never started.
    pub async fn delete(&self) -> ClusterResult<()> {
        let Some(running) = self.running.lock().take() else {
            debug!(syncthr = %self.name, "delete: not running");
            return Ok(());
        };
        *self.last_stats.lock() = running.stats_rx.borrow().clone();

        let (ack_tx, ack_rx) = oneshot::channel();
        let sent = running
            .tx
            .send(Command {
                msg: SyncMsg::Stop,
                ack: Some(ack_tx),
            })
            .await;
        if sent.is_ok() {
            if let Err(e) = self.wait_ack("stop", ack_rx).await {
                debug!(syncthr = %self.name, error = %e, "stop not acknowledged");
            }
        }
        drop(running.tx);
        if let Err(e) = running.task.await {
            warn!(syncthr = %self.name, error = %e, "sync thread task failed");
        }
        *self.last_stats.lock() = running.stats_rx.borrow().clone();
        info!(syncthr = %self.name, "sync thread stopped");
        Ok(())
    }
}

struct Worker<D: SyncDriver> {
    name: String,
    idle_interval: Duration,
    driver: D,
    rx: mpsc::Receiver<Command>,
    state_tx: watch::Sender<SyncState>,
    stats_tx: watch::Sender<SyncThrStats>,
    stats: SyncThrStats,
    frozen: bool,
    remaster_pending: bool,
    requeued: VecDeque<Key>,
}

impl<D: SyncDriver> Worker<D> {
    fn set_state(&self, state: SyncState) {
        debug!(syncthr = %self.name, state = ?state, "sync state");
        let _ = self.state_tx.send(state);
    }

    fn publish(&self) {
        let _ = self.stats_tx.send(self.stats.clone());
    }

    async fn next_command(&mut self) -> Option<Command> {
        if self.frozen || self.idle_interval.is_zero() {
            return self.rx.recv().await;
        }
        loop {
            match tokio::time::timeout(self.idle_interval, self.rx.recv()).await {
                Ok(cmd) => return cmd,
                Err(_) => {
                    self.driver.idle_tick();
                    self.stats.idle_ticks += 1;
                    self.publish();
                }
            }
        }
    }

    fn remaster(&mut self) {
        self.set_state(SyncState::RemasterRequested);
        self.driver.remaster();
        self.stats.remasters += 1;
        self.set_state(SyncState::Idle);
    }

    async fn run(mut self) {
        while let Some(cmd) = self.next_command().await {
            let mut stop = false;
            match cmd.msg {
                SyncMsg::Freeze => {
                    if !self.frozen {
                        self.set_state(SyncState::FreezeRequested);
                        self.frozen = true;
                        self.stats.freezes += 1;
                    }
                    self.set_state(SyncState::Frozen);
                }
                SyncMsg::Unfreeze => {
                    if self.frozen {
                        self.frozen = false;
                        self.stats.unfreezes += 1;
                        self.set_state(SyncState::Idle);
                        if std::mem::take(&mut self.remaster_pending) {
                            self.remaster();
                        }
                        while let Some(key) = self.requeued.pop_front() {
                            self.driver.resync(key);
                            self.stats.resyncs += 1;
                        }
                    }
                }
                SyncMsg::Remaster => {
                    if self.frozen {
                        self.remaster_pending = true;
                        self.stats.deferred += 1;
                    } else {
                        self.remaster();
                    }
                }
                SyncMsg::Requeue(key) => {
                    if self.frozen {
                        self.requeued.push_back(key);
                        self.stats.deferred += 1;
                    } else {
                        self.driver.resync(key);
                        self.stats.resyncs += 1;
                    }
                }
                SyncMsg::Stop => {
                    self.set_state(SyncState::Stopping);
                    stop = true;
                }
            }
            self.publish();
            if stop {
                self.set_state(SyncState::Stopped);
                if let Some(ack) = cmd.ack {
                    let _ = ack.send(());
                }
                return;
            }
            if let Some(ack) = cmd.ack {
                let _ = ack.send(());
            }
        }
        self.set_state(SyncState::Stopped);
    }
}
