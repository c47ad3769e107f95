//! Storage worker threads.
//!
//! Each worker owns one connection per setup for its whole lifetime and
//! runs jobs in the order they were submitted to it.

use crate::broker::{DatabaseRef, SetupContext};
use crate::error::{CoreError, CoreResult};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A unit of work. It receives a scoped handle acquired for its duration.
pub(crate) type Job = Box<dyn FnOnce(CoreResult<DatabaseRef>) + Send>;

pub(crate) struct WorkerPool {
    senders: Vec<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

/// Releases whatever the worker thread still holds when it exits, even
/// when a job panicked.
struct ThreadCleanup(Arc<SetupContext>);

impl Drop for ThreadCleanup {
    fn drop(&mut self) {
        self.0.release_thread(thread::current().id());
    }
}

impl WorkerPool {
    pub(crate) fn start(setup: &Arc<SetupContext>, threads: usize) -> CoreResult<Self> {
        let threads = threads.max(1);
        let mut senders = Vec::with_capacity(threads);
        let mut handles = Vec::with_capacity(threads);
        for index in 0..threads {
            let (tx, rx) = mpsc::channel::<Job>();
            let setup = Arc::clone(setup);
            let handle = thread::Builder::new()
                .name(format!("tidesync-{}-{index}", setup.name()))
                .spawn(move || {
                    let _cleanup = ThreadCleanup(Arc::clone(&setup));
                    let mut held: Option<DatabaseRef> = None;
                    for job in rx {
                        if held.is_none() {
                            held = setup.acquire().ok();
                        }
                        job(setup.acquire());
                    }
                    drop(held);
                })
                .map_err(|e| CoreError::worker_unavailable(format!("spawning worker: {e}")))?;
            senders.push(tx);
            handles.push(handle);
        }
        tracing::debug!(setup = %setup.name(), threads, "started workers");
        Ok(Self { senders, handles })
    }

    pub(crate) fn submit(&self, route: u64, job: Job) -> CoreResult<()> {
        let index = (route % self.senders.len() as u64) as usize;
        self.senders[index]
            .send(job)
            .map_err(|_| CoreError::worker_unavailable(format!("worker {index} has stopped")))
    }

    pub(crate) fn stop(self) {
        drop(self.senders);
        for handle in self.handles {
            if handle.join().is_err() {
                tracing::error!("storage worker panicked");
            }
        }
    }
}
