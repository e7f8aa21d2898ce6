//! The capture engine: owns the adapter, fans captured packets out to a
//! sharded worker fleet, and guarantees fail-open on every shutdown path.

mod worker;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{Adapter, AdapterError};
use crate::flow::sharder::Sharder;
use crate::flow::Key;
use crate::packet::{self, Packet, TCP_FLAG_FIN, TCP_FLAG_RST};
use crate::runtime::conf::EngineConf;

pub(crate) use worker::Worker;

/// TCP port whose outbound traffic is intercepted.
const INTERCEPT_PORT: u16 = 443;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),
    #[error("operation cancelled")]
    Cancelled,
    #[error("shutdown fail-open packet limit reached")]
    ShutdownFailOpenLimitReached,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("reload requires restart: {0}")]
    ReloadRequiresRestart(String),
    #[error("engine is already running")]
    AlreadyRunning,
    #[error("internal error: {0}")]
    Internal(String),
    #[error("{0}; {1}")]
    Joined(Box<EngineError>, Box<EngineError>),
}

impl EngineError {
    /// True when this error (or any joined part) is plain cancellation.
    pub fn is_cancellation(&self) -> bool {
        match self {
            Self::Cancelled | Self::Adapter(AdapterError::Cancelled) => true,
            Self::Joined(a, b) => a.is_cancellation() && b.is_cancellation(),
            _ => false,
        }
    }

    /// True when this error contains one of the bounded-shutdown sentinels,
    /// which are expected during a cancelled shutdown.
    pub fn contains_shutdown_sentinel(&self) -> bool {
        match self {
            Self::ShutdownFailOpenLimitReached | Self::DeadlineExceeded => true,
            Self::Joined(a, b) => a.contains_shutdown_sentinel() || b.contains_shutdown_sentinel(),
            _ => false,
        }
    }
}

/// Per-worker endpoints retained by the engine: the bounded packet queue
/// and the lossy ACK-touch channel.
struct WorkerHandle {
    in_tx: mpsc::Sender<Packet>,
    touch_tx: mpsc::Sender<Key>,
}

impl WorkerHandle {
    /// Hand a packet to the worker, refusing once `cancel` has fired so no
    /// packet is left stranded in a queue during shutdown. The packet is
    /// returned on refusal so the caller can fail it open.
    async fn enqueue(&self, cancel: &CancellationToken, pkt: Packet) -> Result<(), Packet> {
        if cancel.is_cancelled() {
            return Err(pkt);
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(pkt),
            permit = self.in_tx.reserve() => match permit {
                Ok(permit) => {
                    permit.send(pkt);
                    Ok(())
                }
                Err(_) => Err(pkt),
            },
        }
    }
}

pub struct Engine {
    adapter: Arc<dyn Adapter>,
    sharder: Sharder,
    cfg: Arc<ArcSwap<EngineConf>>,
    handles: Arc<Vec<WorkerHandle>>,
    queue_size: usize,
    runnables: Mutex<Option<Vec<Worker>>>,
}

impl Engine {
    pub fn new(cfg: EngineConf, adapter: Arc<dyn Adapter>) -> Self {
        let sharder = Sharder::new(cfg.workers);
        let queue_size = cfg.worker_queue_size.max(1);
        let shared = Arc::new(ArcSwap::from_pointee(cfg));

        let mut handles = Vec::with_capacity(sharder.workers());
        let mut runnables = Vec::with_capacity(sharder.workers());
        for id in 0..sharder.workers() {
            let (in_tx, in_rx) = mpsc::channel(queue_size);
            let (touch_tx, touch_rx) = mpsc::channel(queue_size);
            handles.push(WorkerHandle { in_tx, touch_tx });
            runnables.push(Worker::new(
                id,
                shared.clone(),
                adapter.clone(),
                in_rx,
                touch_rx,
            ));
        }

        Self {
            adapter,
            sharder,
            cfg: shared,
            handles: Arc::new(handles),
            queue_size,
            runnables: Mutex::new(Some(runnables)),
        }
    }

    /// Swap the active configuration without stopping packet processing.
    /// Changes to the sharding/queue topology are rejected; they require a
    /// restart.
    pub fn reload(&self, cfg: EngineConf) -> Result<(), EngineError> {
        if cfg.workers != self.handles.len() {
            return Err(EngineError::ReloadRequiresRestart(format!(
                "workers {} -> {}",
                self.handles.len(),
                cfg.workers
            )));
        }
        if cfg.worker_queue_size > 0 && cfg.worker_queue_size != self.queue_size {
            return Err(EngineError::ReloadRequiresRestart(format!(
                "worker queue size {} -> {}",
                self.queue_size, cfg.worker_queue_size
            )));
        }
        self.cfg.store(Arc::new(cfg));
        info!(event.name = "engine.reloaded", workers = self.handles.len());
        Ok(())
    }

    pub fn config(&self) -> Arc<EngineConf> {
        self.cfg.load_full()
    }

    /// Run until the adapter fails, a worker fails, or `shutdown` fires.
    /// Returns `Ok(())` on a cancellation-driven stop.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), EngineError> {
        let runnables = {
            let mut slot = self
                .runnables
                .lock()
                .map_err(|_| EngineError::Internal("worker slot poisoned".into()))?;
            slot.take().ok_or(EngineError::AlreadyRunning)?
        };

        let cancel = shutdown.child_token();
        let (err_tx, mut err_rx) = mpsc::channel::<EngineError>(1);

        let mut worker_tasks: Vec<JoinHandle<()>> = Vec::with_capacity(runnables.len());
        for mut w in runnables {
            let cancel = cancel.clone();
            let err_tx = err_tx.clone();
            let cfg = self.cfg.clone();
            worker_tasks.push(tokio::spawn(async move {
                let run_err = w.run(&cancel).await.err();
                // A worker error must stop the receive loop before we start
                // failing open, so nothing new lands in the queues.
                if let Some(e) = &run_err {
                    if !e.is_cancellation() {
                        warn!(event.name = "engine.worker_failed", error.message = %e);
                        cancel.cancel();
                    }
                }

                let flush_timeout = {
                    let c = cfg.load();
                    if c.shutdown_fail_open_timeout > Duration::ZERO {
                        c.shutdown_fail_open_timeout
                    } else {
                        Duration::from_secs(5)
                    }
                };
                let deadline = Instant::now() + flush_timeout;
                let fresh = CancellationToken::new();
                let mut flush_err = w.shutdown_fail_open(&fresh, deadline).await.err();

                // Bounded shutdown flushing hitting its guardrails is not a
                // failure when the stop itself was a normal cancellation.
                let run_was_cancel = run_err.as_ref().map(EngineError::is_cancellation);
                if run_was_cancel == Some(true) {
                    if let Some(fe) = &flush_err {
                        if fe.contains_shutdown_sentinel() {
                            flush_err = None;
                        }
                    }
                }

                let mut err = run_err;
                if let Some(fe) = flush_err {
                    err = Some(match err {
                        None => fe,
                        Some(e) if e.is_cancellation() => fe,
                        Some(e) => EngineError::Joined(Box::new(e), Box::new(fe)),
                    });
                    cancel.cancel();
                }

                if let Some(e) = err {
                    if !e.is_cancellation() {
                        let _ = err_tx.try_send(e);
                    }
                }
            }));
        }
        drop(err_tx);

        let mut recv_task = tokio::spawn(recv_loop(
            self.adapter.clone(),
            self.sharder,
            self.handles.clone(),
            cancel.clone(),
        ));

        let mut stop_err: Option<EngineError> = tokio::select! {
            maybe = err_rx.recv() => {
                let e = maybe.unwrap_or(EngineError::Cancelled);
                cancel.cancel();
                // Let the receive loop stop putting packets into worker
                // queues before the workers are joined.
                let _ = flatten_join(&mut recv_task).await;
                Some(e)
            }
            joined = &mut recv_task => {
                let res = match joined {
                    Ok(r) => r,
                    Err(e) => Err(EngineError::Internal(format!("receive loop failed: {e}"))),
                };
                cancel.cancel();
                res.err()
            }
        };

        for task in worker_tasks {
            let _ = task.await;
        }

        // Fail-open whatever the adapter still buffers, then release the
        // capture handle.
        let flush_timeout = {
            let c = self.cfg.load();
            if c.adapter_flush_timeout > Duration::ZERO {
                c.adapter_flush_timeout
            } else {
                Duration::from_secs(2)
            }
        };
        let mut flush_err = match tokio::time::timeout(flush_timeout, self.adapter.flush()).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(EngineError::from(e)),
            Err(_) => Some(EngineError::DeadlineExceeded),
        };
        let stop_was_cancel = stop_err
            .as_ref()
            .map(EngineError::is_cancellation)
            .unwrap_or(true);
        if stop_was_cancel && matches!(flush_err, Some(EngineError::DeadlineExceeded)) {
            flush_err = None;
        }
        if let Some(fe) = flush_err {
            stop_err = Some(match stop_err {
                None => fe,
                Some(e) if e.is_cancellation() => fe,
                Some(e) => EngineError::Joined(Box::new(e), Box::new(fe)),
            });
        }
        if let Err(e) = self.adapter.close() {
            debug!(event.name = "engine.adapter_close_failed", error.message = %e);
        }

        // A cancellation-driven stop still surfaces a worker error that
        // raced in during shutdown.
        if stop_err
            .as_ref()
            .map(EngineError::is_cancellation)
            .unwrap_or(true)
        {
            if let Ok(e) = err_rx.try_recv() {
                stop_err = Some(e);
            }
        }

        match stop_err {
            None => Ok(()),
            Some(e) if e.is_cancellation() => Ok(()),
            Some(e) => Err(e),
        }
    }
}

async fn flatten_join(task: &mut JoinHandle<Result<(), EngineError>>) -> Result<(), EngineError> {
    match task.await {
        Ok(r) => r,
        Err(e) => Err(EngineError::Internal(format!("receive loop failed: {e}"))),
    }
}

/// Pull packets from the adapter and dispatch them: non-target and
/// undecodable traffic passes straight through, ACK-only packets take the
/// touch fast path, everything else is sharded to its worker. Runs until
/// the adapter reports an error (cancellation included).
async fn recv_loop(
    adapter: Arc<dyn Adapter>,
    sharder: Sharder,
    handles: Arc<Vec<WorkerHandle>>,
    cancel: CancellationToken,
) -> Result<(), EngineError> {
    loop {
        let mut pkt = match adapter.recv(&cancel).await {
            Ok(Some(pkt)) => pkt,
            Ok(None) => continue,
            Err(e) => return Err(e.into()),
        };

        if packet::decode(&mut pkt).is_err() {
            adapter.send(pkt).await?;
            continue;
        }
        if pkt.meta.dst_port != INTERCEPT_PORT {
            adapter.send(pkt).await?;
            continue;
        }

        let key = Key::from_meta(&pkt.meta);
        let handle = &handles[sharder.index(&key)];

        if pkt.payload().is_empty()
            && !pkt.has_flag(TCP_FLAG_FIN)
            && !pkt.has_flag(TCP_FLAG_RST)
        {
            // ACK-only fast path: pass through immediately and keep the
            // flow's idle clock fresh, best-effort.
            let _ = handle.touch_tx.try_send(key);
            adapter.send(pkt).await?;
            continue;
        }

        match handle.enqueue(&cancel, pkt).await {
            Ok(()) => {}
            Err(pkt) => {
                // Shutting down (or the worker is gone): fail the packet
                // open instead of leaving it captured.
                adapter.send(pkt).await?;
            }
        }
    }
}
