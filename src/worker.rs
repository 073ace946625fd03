//! Workers and the task pool
//!
//! A worker is the per-thread context a task runs under; its statistics
//! counters are plain integers touched without locking and folded into the
//! pool-wide aggregate when a task finishes. The pool is a fixed set of OS
//! threads fed from a bounded channel; scheduling a task can fail when the
//! pool is saturated, and callers must handle that (a fetch that cannot be
//! scheduled fails its objcore).

use std::sync::Arc;

use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::Mutex;

/// Scheduling class of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPrio {
    /// Foreground backend fetch
    Bo,
    /// Background fetch (grace refresh)
    Bg,
}

/// Per-worker statistics, lock-free on the update path.
#[derive(Debug, Default, Clone)]
pub struct WrkStats {
    pub cache_hit: u64,
    pub cache_hit_grace: u64,
    pub cache_miss: u64,
    pub s_fetch: u64,
    pub s_bgfetch: u64,
    pub s_pass: u64,
    pub s_pipe: u64,
    pub s_synth: u64,
    pub fetch_failed: u64,
    pub beresp_uncacheable: u64,
    pub beresp_shortlived: u64,
    pub client_req_400: u64,
    pub client_req_417: u64,
    pub bgfetch_no_thread: u64,
    pub ws_client_overflow: u64,
}

macro_rules! fold {
    ($into:expr, $from:expr, $($f:ident),+) => {
        $( $into.$f += $from.$f; )+
    };
}

impl WrkStats {
    pub fn fold(&mut self, other: &WrkStats) {
        fold!(
            self, other, cache_hit, cache_hit_grace, cache_miss, s_fetch, s_bgfetch, s_pass,
            s_pipe, s_synth, fetch_failed, beresp_uncacheable, beresp_shortlived, client_req_400,
            client_req_417, bgfetch_no_thread, ws_client_overflow
        );
    }
}

/// Per-thread task context.
pub struct Worker {
    pub stats: WrkStats,
    global: Arc<Mutex<WrkStats>>,
}

impl Worker {
    pub fn new(global: Arc<Mutex<WrkStats>>) -> Self {
        Self {
            stats: WrkStats::default(),
            global,
        }
    }

    /// Fold the local counters into the aggregate.
    pub fn flush_stats(&mut self) {
        let local = std::mem::take(&mut self.stats);
        self.global.lock().fold(&local);
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.flush_stats();
    }
}

type Task = Box<dyn FnOnce(&mut Worker) + Send>;

/// A fixed pool of worker threads.
pub struct Pool {
    tx: Sender<(TaskPrio, Task)>,
    stats: Arc<Mutex<WrkStats>>,
}

impl Pool {
    pub fn new(threads: usize, queue_depth: usize) -> Arc<Self> {
        let (tx, rx) = bounded::<(TaskPrio, Task)>(queue_depth);
        let stats = Arc::new(Mutex::new(WrkStats::default()));
        for i in 0..threads.max(1) {
            let rx = rx.clone();
            let stats = stats.clone();
            std::thread::Builder::new()
                .name(format!("cache-wrk-{i}"))
                .spawn(move || {
                    let mut wrk = Worker::new(stats);
                    while let Ok((_prio, task)) = rx.recv() {
                        task(&mut wrk);
                        wrk.flush_stats();
                    }
                })
                .expect("spawning worker thread");
        }
        Arc::new(Self { tx, stats })
    }

    /// Schedule a task; fails when the pool is saturated.
    pub fn task(
        &self,
        prio: TaskPrio,
        f: impl FnOnce(&mut Worker) + Send + 'static,
    ) -> Result<(), ()> {
        match self.tx.try_send((prio, Box::new(f))) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => Err(()),
        }
    }

    /// A worker context for tasks running on a caller-owned thread.
    pub fn worker(&self) -> Worker {
        Worker::new(self.stats.clone())
    }

    /// Aggregated statistics snapshot.
    pub fn stats(&self) -> WrkStats {
        self.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasks_run_and_stats_aggregate() {
        let pool = Pool::new(2, 16);
        let (tx, rx) = crossbeam_channel::bounded(1);
        pool.task(TaskPrio::Bo, move |wrk| {
            wrk.stats.s_fetch += 1;
            tx.send(()).unwrap();
        })
        .unwrap();
        rx.recv().unwrap();
        // flushed after task completion
        assert_eq!(pool.stats().s_fetch, 1);
    }

    #[test]
    fn saturated_pool_refuses_tasks() {
        let pool = Pool::new(1, 1);
        let (started_tx, started_rx) = crossbeam_channel::bounded::<()>(1);
        let (hold_tx, hold_rx) = crossbeam_channel::bounded::<()>(0);
        // occupy the only thread
        pool.task(TaskPrio::Bo, move |_| {
            started_tx.send(()).unwrap();
            let _ = hold_rx.recv();
        })
        .unwrap();
        started_rx.recv().unwrap();
        // fill the single queue slot, then overflow
        assert!(pool.task(TaskPrio::Bg, |_| {}).is_ok());
        assert!(pool.task(TaskPrio::Bg, |_| {}).is_err());
        drop(hold_tx);
    }
}
