use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use flume::{RecvTimeoutError, TrySendError};
use parking_lot::Mutex;

/// A unit of work executed on a worker thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone)]
/// Sizing of the request worker pool.
pub struct WorkerPoolConfig {
    /// The number of workers which are kept alive even when idle.
    pub core_size: usize,
    /// The maximum number of workers running at once.
    ///
    /// Workers above the core size are only started when the queue is full.
    pub max_size: usize,
    /// How long a worker above the core size may sit idle before it exits.
    pub keep_alive: Duration,
    /// The number of jobs which may wait for a free worker.
    pub queue_size: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            core_size: 5,
            max_size: 10,
            keep_alive: Duration::from_secs(300),
            queue_size: 100,
        }
    }
}

impl WorkerPoolConfig {
    pub fn new(core_size: usize, max_size: usize, keep_alive: Duration) -> Self {
        Self {
            core_size,
            max_size: max_size.max(core_size).max(1),
            keep_alive,
            ..Default::default()
        }
    }

    /// Set the number of jobs which may wait for a free worker.
    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Worker pool is saturated: {workers} workers busy and {queued} jobs queued.")]
/// The pool refused the job as every worker is busy and the queue is full.
pub struct Rejected {
    pub workers: usize,
    pub queued: usize,
}

#[derive(Clone)]
/// A bounded pool of worker threads for running request handlers.
///
/// Handlers run on plain threads so a slow or blocking handler only ever
/// occupies its own worker, never the connection tasks.
pub struct WorkerPool(Arc<WorkerPoolInner>);

struct WorkerPoolInner {
    name: String,
    config: WorkerPoolConfig,
    tx: Mutex<Option<flume::Sender<Job>>>,
    rx: flume::Receiver<Job>,
    num_workers: Arc<AtomicUsize>,
    spawned: AtomicUsize,
}

impl WorkerPool {
    /// Creates a new pool and starts the core workers.
    pub fn new(name: impl Into<String>, config: WorkerPoolConfig) -> io::Result<Self> {
        let (tx, rx) = flume::bounded(config.queue_size);
        let pool = Self(Arc::new(WorkerPoolInner {
            name: name.into(),
            config,
            tx: Mutex::new(Some(tx)),
            rx,
            num_workers: Arc::new(AtomicUsize::new(0)),
            spawned: AtomicUsize::new(0),
        }));

        for _ in 0..pool.0.config.core_size {
            pool.0.num_workers.fetch_add(1, Ordering::SeqCst);
            pool.spawn_worker(None, true)?;
        }

        Ok(pool)
    }

    /// Submits a job to the pool.
    ///
    /// The job is queued if a worker is not free, if the queue is full
    /// a new worker is started provided the pool is below its max size,
    /// otherwise the job is rejected.
    pub fn try_execute(&self, job: Job) -> Result<(), Rejected> {
        let tx = match self.0.tx.lock().as_ref() {
            Some(tx) => tx.clone(),
            None => return Err(self.rejected()),
        };

        let job = match tx.try_send(job) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(job)) => job,
            Err(TrySendError::Disconnected(_)) => return Err(self.rejected()),
        };

        if !self.try_reserve_worker() {
            return Err(self.rejected());
        }

        if let Err(e) = self.spawn_worker(Some(job), false) {
            warn!(error = ?e, pool = %self.0.name, "Failed to start additional worker.");
            return Err(self.rejected());
        }

        Ok(())
    }

    #[inline]
    /// The number of live workers.
    pub fn num_workers(&self) -> usize {
        self.0.num_workers.load(Ordering::SeqCst)
    }

    #[inline]
    /// The number of jobs waiting for a worker.
    pub fn num_queued(&self) -> usize {
        self.0.rx.len()
    }

    /// Stops accepting new jobs.
    ///
    /// Jobs already queued are still run before the workers exit. The
    /// workers are not joined, this returns straight away.
    pub fn shutdown(&self) {
        self.0.tx.lock().take();
    }

    fn rejected(&self) -> Rejected {
        Rejected {
            workers: self.num_workers(),
            queued: self.num_queued(),
        }
    }

    fn try_reserve_worker(&self) -> bool {
        let max_size = self.0.config.max_size;
        let mut current = self.0.num_workers.load(Ordering::SeqCst);
        loop {
            if current >= max_size {
                return false;
            }

            match self.0.num_workers.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Starts a worker thread, the worker slot must already be reserved.
    fn spawn_worker(&self, first_job: Option<Job>, is_core: bool) -> io::Result<()> {
        let id = self.0.spawned.fetch_add(1, Ordering::Relaxed);
        let rx = self.0.rx.clone();
        let num_workers = self.0.num_workers.clone();
        let keep_alive = if is_core {
            None
        } else {
            Some(self.0.config.keep_alive)
        };

        let result = thread::Builder::new()
            .name(format!("{}-worker-{}", self.0.name, id))
            .spawn(move || {
                run_worker(rx, first_job, keep_alive);
                num_workers.fetch_sub(1, Ordering::SeqCst);
            });

        if let Err(e) = result {
            self.0.num_workers.fetch_sub(1, Ordering::SeqCst);
            return Err(e);
        }

        Ok(())
    }
}

/// Runs jobs until the pool shuts down, or until the worker has been idle
/// for `keep_alive` if the worker is not a core worker.
fn run_worker(rx: flume::Receiver<Job>, first_job: Option<Job>, keep_alive: Option<Duration>) {
    if let Some(job) = first_job {
        run_job(job);
    }

    loop {
        let job = match keep_alive {
            None => match rx.recv() {
                Ok(job) => job,
                Err(_) => break,
            },
            Some(keep_alive) => match rx.recv_timeout(keep_alive) {
                Ok(job) => job,
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => break,
            },
        };

        run_job(job);
    }
}

fn run_job(job: Job) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!("Worker job panicked, the worker will continue running.");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    fn blocking_job(release: &Arc<(std::sync::Mutex<bool>, std::sync::Condvar)>) -> Job {
        let release = release.clone();
        Box::new(move || {
            let (lock, cvar) = &*release;
            let mut released = lock.lock().unwrap();
            while !*released {
                released = cvar.wait(released).unwrap();
            }
        })
    }

    fn release_all(release: &Arc<(std::sync::Mutex<bool>, std::sync::Condvar)>) {
        let (lock, cvar) = &**release;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }

    #[test]
    fn test_runs_jobs() {
        let pool = WorkerPool::new("test", WorkerPoolConfig::new(2, 4, Duration::from_secs(1)))
            .unwrap();
        assert_eq!(pool.num_workers(), 2);

        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            pool.try_execute(Box::new(move || tx.send(i).unwrap())).unwrap();
        }

        let mut results = (0..10).map(|_| rx.recv().unwrap()).collect::<Vec<_>>();
        results.sort_unstable();
        assert_eq!(results, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_rejects_when_saturated() {
        let config = WorkerPoolConfig::new(1, 2, Duration::from_secs(30)).with_queue_size(1);
        let pool = WorkerPool::new("test", config).unwrap();
        let release = Arc::new((std::sync::Mutex::new(false), std::sync::Condvar::new()));

        // Occupies the core worker, then fills the queue, then the extra worker.
        pool.try_execute(blocking_job(&release)).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while pool.num_queued() != 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        pool.try_execute(blocking_job(&release)).unwrap();
        pool.try_execute(blocking_job(&release)).unwrap();
        assert_eq!(pool.num_workers(), 2);

        let rejected = pool
            .try_execute(blocking_job(&release))
            .expect_err("Pool should be saturated");
        assert_eq!(rejected.workers, 2);

        release_all(&release);
    }

    #[test]
    fn test_extra_workers_retire() {
        let config = WorkerPoolConfig::new(0, 1, Duration::from_millis(50)).with_queue_size(0);
        let pool = WorkerPool::new("test", config).unwrap();
        assert_eq!(pool.num_workers(), 0);

        let (tx, rx) = mpsc::channel();
        pool.try_execute(Box::new(move || tx.send(()).unwrap())).unwrap();
        rx.recv().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while pool.num_workers() != 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.num_workers(), 0, "Idle extra worker should exit.");
    }

    #[test]
    fn test_panicking_job_keeps_worker() {
        let pool = WorkerPool::new("test", WorkerPoolConfig::new(1, 1, Duration::from_secs(1)))
            .unwrap();
        pool.try_execute(Box::new(|| panic!("boom"))).unwrap();

        let (tx, rx) = mpsc::channel();
        pool.try_execute(Box::new(move || tx.send(()).unwrap())).unwrap();
        rx.recv_timeout(Duration::from_secs(5))
            .expect("Worker should survive a panicking job");
        assert_eq!(pool.num_workers(), 1);
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let config = WorkerPoolConfig::new(1, 1, Duration::from_secs(1)).with_queue_size(4);
        let pool = WorkerPool::new("test", config).unwrap();
        let release = Arc::new((std::sync::Mutex::new(false), std::sync::Condvar::new()));

        pool.try_execute(blocking_job(&release)).unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..3 {
            let tx = tx.clone();
            pool.try_execute(Box::new(move || tx.send(i).unwrap())).unwrap();
        }

        pool.shutdown();
        assert!(pool.try_execute(Box::new(|| {})).is_err());
        release_all(&release);

        let results = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(results, [0, 1, 2]);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while pool.num_workers() != 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.num_workers(), 0, "Workers should exit once the queue is drained.");
    }

    #[test]
    fn test_shutdown_rejects() {
        let pool = WorkerPool::new("test", WorkerPoolConfig::default()).unwrap();
        pool.shutdown();
        assert!(pool.try_execute(Box::new(|| {})).is_err());
    }
}
