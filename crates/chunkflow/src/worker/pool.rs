use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, info};

use super::runner::{AdvanceOutcome, StepRunner};
use crate::db::work_unit_repo::WorkUnitRow;
use crate::error::{ChunkflowError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The result of advancing one submitted unit.
#[derive(Debug)]
pub struct WorkResult {
    pub unit_id: String,
    pub job_id: String,
    pub outcome: Result<AdvanceOutcome>,
}

/// Caps how many units of one job run at the same time.
struct JobSlots {
    limit: usize,
    active: Mutex<HashMap<String, usize>>,
    freed: Condvar,
}

struct SlotGuard {
    slots: Arc<JobSlots>,
    job_id: String,
}

impl JobSlots {
    fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            active: Mutex::new(HashMap::new()),
            freed: Condvar::new(),
        }
    }

    /// Blocks until the job has a free slot. Returns `None` on shutdown.
    fn acquire(self: &Arc<Self>, job_id: &str, shutdown: &AtomicBool) -> Option<SlotGuard> {
        let mut active = self.active.lock().ok()?;
        loop {
            {
                let count = active.entry(job_id.to_string()).or_insert(0);
                if *count < self.limit {
                    *count += 1;
                    return Some(SlotGuard {
                        slots: Arc::clone(self),
                        job_id: job_id.to_string(),
                    });
                }
            }
            if shutdown.load(Ordering::Relaxed) {
                return None;
            }
            let (guard, _) = self.freed.wait_timeout(active, POLL_INTERVAL).ok()?;
            active = guard;
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Ok(mut active) = self.slots.active.lock() {
            if let Some(count) = active.get_mut(&self.job_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    active.remove(&self.job_id);
                }
            }
        }
        self.slots.freed.notify_all();
    }
}

pub struct WorkerPool {
    unit_sender: Sender<WorkUnitRow>,
    result_receiver: Receiver<WorkResult>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Starts `worker_count` threads, each advancing submitted units with its
    /// own clone of `runner`. At most `max_parallel_per_job` units of one job
    /// run at once.
    ///
    /// # Panics
    /// Panics if `worker_count` is 0.
    pub fn new(runner: StepRunner, worker_count: usize, max_parallel_per_job: usize) -> Self {
        assert!(worker_count > 0, "worker_count must be > 0");
        let (unit_sender, unit_receiver) = bounded::<WorkUnitRow>(worker_count * 2);
        let (result_sender, result_receiver) = bounded::<WorkResult>(worker_count * 2);
        let shutdown = Arc::new(AtomicBool::new(false));
        let slots = Arc::new(JobSlots::new(max_parallel_per_job));

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let unit_rx = unit_receiver.clone();
            let result_tx = result_sender.clone();
            let shutdown_flag = Arc::clone(&shutdown);
            let worker_slots = Arc::clone(&slots);
            let worker_runner = runner.clone();

            let handle = thread::spawn(move || {
                run_worker(
                    worker_id,
                    unit_rx,
                    result_tx,
                    shutdown_flag,
                    worker_slots,
                    worker_runner,
                );
            });
            workers.push(handle);
        }

        info!(
            "Started {} workers ({} units per job)",
            worker_count, max_parallel_per_job
        );

        Self {
            unit_sender,
            result_receiver,
            workers,
            shutdown,
        }
    }

    pub fn submit(&self, unit: WorkUnitRow) -> Result<()> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(ChunkflowError::PoolClosed);
        }

        self.unit_sender
            .send(unit)
            .map_err(|_| ChunkflowError::PoolClosed)
    }

    pub fn try_recv_result(&self) -> Option<WorkResult> {
        self.result_receiver.try_recv().ok()
    }

    pub fn recv_result(&self) -> Option<WorkResult> {
        self.result_receiver.recv().ok()
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn wait(self) {
        drop(self.unit_sender);

        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        info!("All workers have stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Submits `units` and every follow-up they queue, returning once the
    /// chains run dry. At most one unit per worker is in flight, so neither
    /// channel can fill up while results go unread.
    pub fn run_to_completion(&self, units: Vec<WorkUnitRow>) -> Result<Vec<WorkResult>> {
        let window = self.workers.len().max(1);
        let mut pending: VecDeque<WorkUnitRow> = units.into();
        let mut in_flight = 0;
        let mut results = Vec::new();

        loop {
            while in_flight < window {
                let Some(unit) = pending.pop_front() else {
                    break;
                };
                self.submit(unit)?;
                in_flight += 1;
            }
            if in_flight == 0 {
                break;
            }

            let result = self.recv_result().ok_or(ChunkflowError::PoolClosed)?;
            in_flight -= 1;
            if let Ok(outcome) = &result.outcome {
                if let Some(next) = outcome.follow_up() {
                    pending.push_back(next.clone());
                }
            }
            results.push(result);
        }
        Ok(results)
    }
}

fn run_worker(
    worker_id: usize,
    unit_receiver: Receiver<WorkUnitRow>,
    result_sender: Sender<WorkResult>,
    shutdown: Arc<AtomicBool>,
    slots: Arc<JobSlots>,
    runner: StepRunner,
) {
    debug!("Worker {} started", worker_id);

    loop {
        if shutdown.load(Ordering::Relaxed) {
            debug!("Worker {} received shutdown signal", worker_id);
            break;
        }

        match unit_receiver.recv_timeout(POLL_INTERVAL) {
            Ok(unit) => {
                let Some(slot) = slots.acquire(&unit.job_id, &shutdown) else {
                    debug!("Worker {} dropped unit {} on shutdown", worker_id, unit.id);
                    break;
                };
                debug!("Worker {} advancing unit {} ({})", worker_id, unit.id, unit.step);
                let outcome = runner.advance(&unit.id);
                drop(slot);

                if let Err(e) = &outcome {
                    error!("Worker {} failed to advance unit {}: {}", worker_id, unit.id, e);
                }
                let result = WorkResult {
                    unit_id: unit.id,
                    job_id: unit.job_id,
                    outcome,
                };
                if let Err(e) = result_sender.send(result) {
                    error!("Worker {} failed to send result: {}", worker_id, e);
                    break;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                continue;
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                debug!("Worker {} unit channel disconnected", worker_id);
                break;
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}
