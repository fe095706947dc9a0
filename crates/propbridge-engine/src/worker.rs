/*!
 * Fixed pool of named worker threads.
 *
 * Client requests run on these threads. Each worker is a plain OS thread,
 * so device operations reach the execution bridge from a blocking context
 * and every worker lazily gets its own execution context.
 */
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, error, info};

use propbridge_core::config::RuntimeConfig;
use propbridge_core::utils::spawn_named;

use crate::error::{Error, Result};

/// Fewest workers a pool runs; a sampling loop occupies one for its whole run
pub const MIN_WORKERS: usize = 2;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Pool of blocking worker threads
#[derive(Debug)]
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Start a pool sized from the runtime configuration
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let size = match config.worker_threads {
            0 => thread::available_parallelism().map_or(MIN_WORKERS, |n| n.get()),
            n => n,
        }
        .max(MIN_WORKERS);

        let (sender, receiver) = unbounded::<Job>();

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = receiver.clone();
            let name = format!("{}-{}", config.thread_name, index);
            workers.push(spawn_named(&name, move || {
                work(receiver);
                Ok::<(), Error>(())
            })?);
        }

        info!("Worker pool started with {} threads", size);
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            size,
        })
    }

    /// Number of worker threads
    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a job for the next free worker
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(sender) => sender
                .send(Box::new(job))
                .map_err(|_| Error::other("worker pool is not accepting jobs")),
            None => Err(Error::other("worker pool is shut down")),
        }
    }

    /// Stop accepting jobs, finish queued ones and join the workers
    pub fn shutdown(&self) {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for worker in workers {
            if worker.join().is_err() {
                error!("Worker thread panicked");
            }
        }
        debug!("Worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn work(receiver: Receiver<Job>) {
    for job in receiver.iter() {
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("Job panicked on {:?}", thread::current().name());
        }
    }
}
