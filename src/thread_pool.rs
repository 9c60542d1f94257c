//! A fixed-size worker pool for compression and sink I/O.
//!
//! Jobs are fallible: a job that fails reports its error message through the
//! pool's error sink (which latches the owning stream's error state) and does
//! not cancel other queued or in-flight jobs.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::error::ZarrError;

type Job = Box<dyn FnOnce() -> Result<(), String> + Send + 'static>;
type ErrorSink = Box<dyn Fn(String) + Send + Sync + 'static>;

struct Queue {
    jobs: VecDeque<Job>,
    shutting_down: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    work_available: Condvar,
    error_sink: ErrorSink,
}

/// A fixed-size pool of worker threads executing fallible jobs in FIFO order.
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ThreadPool {
    /// Spin up `num_threads` workers. Zero means hardware parallelism.
    pub fn new(num_threads: usize, error_sink: impl Fn(String) + Send + Sync + 'static) -> Self {
        let num_threads = if num_threads == 0 {
            thread::available_parallelism().map_or_else(
                |_| {
                    log::warn!("unable to determine hardware concurrency, using 1 thread");
                    1
                },
                std::num::NonZeroUsize::get,
            )
        } else {
            num_threads
        };

        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                jobs: VecDeque::new(),
                shutting_down: false,
            }),
            work_available: Condvar::new(),
            error_sink: Box::new(error_sink),
        });

        let workers = (0..num_threads)
            .map(|_| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || Self::worker_loop(&shared))
            })
            .collect();

        Self { shared, workers }
    }

    fn worker_loop(shared: &Shared) {
        loop {
            let job = {
                let mut queue = shared.queue.lock().unwrap();
                loop {
                    if let Some(job) = queue.jobs.pop_front() {
                        break job;
                    }
                    if queue.shutting_down {
                        return;
                    }
                    queue = shared.work_available.wait(queue).unwrap();
                }
            };

            if let Err(err) = job() {
                log::error!("worker job failed: {err}");
                (shared.error_sink)(err);
            }
        }
    }

    /// Queue a job for execution.
    ///
    /// # Errors
    /// Returns [`ZarrError::InternalError`] if the pool is shutting down.
    pub fn submit(
        &self,
        job: impl FnOnce() -> Result<(), String> + Send + 'static,
    ) -> Result<(), ZarrError> {
        let mut queue = self.shared.queue.lock().unwrap();
        if queue.shutting_down {
            return Err(ZarrError::InternalError(
                "cannot submit a job to a stopped thread pool".to_string(),
            ));
        }
        queue.jobs.push_back(Box::new(job));
        drop(queue);
        self.shared.work_available.notify_one();
        Ok(())
    }

    /// Drain the queue and join every worker. Idempotent.
    pub fn await_stop(&mut self) {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.shutting_down = true;
        }
        self.shared.work_available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.await_stop();
    }
}

/// A completion barrier for a batch of jobs.
///
/// Each job holds a [`WaitGuard`]; the counter drops to zero when every guard
/// is dropped, releasing [`WaitGroup::wait`]. Guards count down even if the
/// job panics.
#[derive(Clone, Default)]
pub(crate) struct WaitGroup {
    inner: Arc<(Mutex<usize>, Condvar)>,
}

impl WaitGroup {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register one pending job.
    pub(crate) fn guard(&self) -> WaitGuard {
        let (count, _) = &*self.inner;
        *count.lock().unwrap() += 1;
        WaitGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Block until every outstanding guard has been dropped.
    pub(crate) fn wait(&self) {
        let (count, zero) = &*self.inner;
        let mut count = count.lock().unwrap();
        while *count > 0 {
            count = zero.wait(count).unwrap();
        }
    }
}

pub(crate) struct WaitGuard {
    inner: Arc<(Mutex<usize>, Condvar)>,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        let (count, zero) = &*self.inner;
        let mut count = count.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            zero.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn runs_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pool = ThreadPool::new(4, |_| {});
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        }
        pool.await_stop();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn reports_failures_without_cancelling_siblings() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let completed = Arc::new(AtomicUsize::new(0));
        let mut pool = ThreadPool::new(2, {
            let errors = Arc::clone(&errors);
            move |msg| errors.lock().unwrap().push(msg)
        });

        pool.submit(|| Err("broken".to_string())).unwrap();
        for _ in 0..10 {
            let completed = Arc::clone(&completed);
            pool.submit(move || {
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        }
        pool.await_stop();

        assert_eq!(errors.lock().unwrap().as_slice(), ["broken"]);
        assert_eq!(completed.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn submit_after_stop_fails() {
        let mut pool = ThreadPool::new(1, |_| {});
        pool.await_stop();
        assert!(pool.submit(|| Ok(())).is_err());
    }

    #[test]
    fn wait_group_blocks_until_done() {
        let pool = ThreadPool::new(4, |_| {});
        let wg = WaitGroup::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let guard = wg.guard();
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                let _guard = guard;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        }
        wg.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }
}
