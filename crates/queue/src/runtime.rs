//! Background worker and sweeper threads.

use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info};

use crate::error::{QueueError, QueueResult};
use crate::sweeper::CleanupSweeper;
use crate::worker::WorkerPool;

/// Counters shared by every worker of one queue.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RuntimeStats {
    pub processed: u64,
    pub acked: u64,
    pub nacked: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub lease_lost: u64,
    pub reclaimed: u64,
    pub workers: usize,
    pub uptime_secs: u64,
}

/// Handle to running workers. Dropping it stops them too; [`QueueRuntime::shutdown`]
/// additionally waits for in-progress deliveries to settle.
#[derive(Debug)]
pub struct QueueRuntime {
    shutdown: Vec<mpsc::Sender<()>>,
    joins: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<RuntimeStats>>,
    started: Instant,
}

impl QueueRuntime {
    pub(crate) fn spawn(
        pool: WorkerPool,
        sweeper: CleanupSweeper,
        workers: usize,
        poll_interval: Duration,
        stats: Arc<Mutex<RuntimeStats>>,
    ) -> QueueResult<Self> {
        let mut runtime = Self {
            shutdown: Vec::with_capacity(workers + 1),
            joins: Vec::with_capacity(workers + 1),
            stats,
            started: Instant::now(),
        };

        for n in 0..workers {
            let name = format!("trackflow-worker-{n}");
            let pool = pool.clone();
            let (tx, rx) = mpsc::channel::<()>();
            let join = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(&name, pool, rx, poll_interval))
                .map_err(|e| QueueError::transport(format!("failed to spawn worker thread: {e}")))?;
            runtime.shutdown.push(tx);
            runtime.joins.push(join);
        }

        let (tx, rx) = mpsc::channel::<()>();
        let sweeper_stats = runtime.stats.clone();
        let join = thread::Builder::new()
            .name("trackflow-sweeper".to_string())
            .spawn(move || sweeper_loop(sweeper, rx, poll_interval, sweeper_stats))
            .map_err(|e| QueueError::transport(format!("failed to spawn sweeper thread: {e}")))?;
        runtime.shutdown.push(tx);
        runtime.joins.push(join);

        runtime.lock_stats().workers = workers;
        info!(workers, "queue runtime started");
        Ok(runtime)
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, RuntimeStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stop all threads and wait for them to finish their current batch.
    pub fn shutdown(mut self) {
        for tx in self.shutdown.drain(..) {
            let _ = tx.send(());
        }
        for join in self.joins.drain(..) {
            let _ = join.join();
        }
        self.lock_stats().workers = 0;
        info!("queue runtime stopped");
    }

    pub fn stats(&self) -> RuntimeStats {
        let mut stats = self.lock_stats().clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

/// Sleep for `interval` unless shutdown is requested first. Returns `true`
/// when the loop should stop.
fn wait_or_stop(rx: &mpsc::Receiver<()>, interval: Duration) -> bool {
    !matches!(rx.recv_timeout(interval), Err(mpsc::RecvTimeoutError::Timeout))
}

fn should_stop(rx: &mpsc::Receiver<()>) -> bool {
    !matches!(rx.try_recv(), Err(mpsc::TryRecvError::Empty))
}

fn worker_loop(name: &str, pool: WorkerPool, rx: mpsc::Receiver<()>, poll_interval: Duration) {
    info!(worker = name, "queue worker started");
    loop {
        if should_stop(&rx) {
            break;
        }
        match pool.poll_once(name) {
            Ok(0) => {
                if wait_or_stop(&rx, poll_interval) {
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!(worker = name, error = %e, "poll failed");
                if wait_or_stop(&rx, poll_interval) {
                    break;
                }
            }
        }
    }
    info!(worker = name, "queue worker stopped");
}

fn sweeper_loop(
    sweeper: CleanupSweeper,
    rx: mpsc::Receiver<()>,
    interval: Duration,
    stats: Arc<Mutex<RuntimeStats>>,
) {
    info!("cleanup sweeper started");
    loop {
        match sweeper.sweep_once() {
            Ok(report) => {
                let mut s = stats.lock().unwrap_or_else(|e| e.into_inner());
                s.reclaimed += report.reclaimed as u64;
            }
            Err(e) => error!(error = %e, "sweep failed"),
        }
        if wait_or_stop(&rx, interval) {
            break;
        }
    }
    info!("cleanup sweeper stopped");
}
