use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Receiver;

use crate::scheduler::{Scheduler, WorkerMessage};

/// A pool of stateless workers consuming jobs from the scheduler queue.
///
/// Each worker runs one job at a time; within a job the execution is sequential and the only
/// suspension point is the dependency check. A dedicated pump thread re-publishes the jobs whose
/// back-off expired.
pub struct WorkerPool {
    scheduler: Arc<Scheduler>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `num_workers` workers plus the back-off pump.
    pub fn start(
        scheduler: Arc<Scheduler>,
        receiver: Receiver<WorkerMessage>,
        num_workers: usize,
    ) -> WorkerPool {
        assert!(num_workers > 0, "The worker pool cannot be empty");
        let mut workers = vec![];
        for i in 0..num_workers {
            let scheduler = scheduler.clone();
            let receiver = receiver.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("worker-{}", i))
                    .spawn(move || worker_loop(&scheduler, &receiver))
                    .expect("Failed to spawn worker"),
            );
        }
        {
            let scheduler = scheduler.clone();
            workers.push(
                std::thread::Builder::new()
                    .name("backoff-pump".into())
                    .spawn(move || pump_loop(&scheduler))
                    .expect("Failed to spawn back-off pump"),
            );
        }
        WorkerPool { scheduler, workers }
    }

    /// Stop the pool, waiting for the running jobs to finish.
    pub fn stop(self) {
        self.scheduler.delay.stop();
        // one Exit per worker; the pump has already been stopped above
        for _ in 0..self.workers.len() {
            let _ = self.scheduler.sender.send(WorkerMessage::Exit);
        }
        for worker in self.workers {
            if let Err(e) = worker.join() {
                error!("Worker thread panicked: {:?}", e);
            }
        }
    }
}

/// The loop of a single worker.
fn worker_loop(scheduler: &Scheduler, receiver: &Receiver<WorkerMessage>) {
    while let Ok(message) = receiver.recv() {
        match message {
            WorkerMessage::Run(id) => scheduler.process_job(id),
            WorkerMessage::Exit => break,
        }
    }
    trace!("Worker exiting");
}

/// The loop of the back-off pump: move the due jobs back to the worker queue.
fn pump_loop(scheduler: &Scheduler) {
    while let Some(id) = scheduler.delay.next() {
        if scheduler.sender.send(WorkerMessage::Run(id)).is_err() {
            break;
        }
    }
    trace!("Back-off pump exiting");
}
