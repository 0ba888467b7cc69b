//! Fixed-size pools of compression/decompression worker threads.
//!
//! Each worker owns its own mutex+condvar pair (the "per-worker" lock in
//! the documented lock order); a page is handed to a worker chosen
//! round-robin, and the driver can submit to a different, idle worker
//! before collecting an earlier one's result, so compression of several
//! pages overlaps even though each individual worker processes one page
//! at a time.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;

struct Job {
    quit: bool,
    /// `Some(input)` while a job is queued or in flight; taken by the
    /// worker once it starts, `None` once the result has been produced.
    pending_input: Option<Vec<u8>>,
    output: Option<Vec<u8>>,
}

struct Worker {
    mutex: Mutex<Job>,
    cond: Condvar,
}

impl Worker {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            mutex: Mutex::new(Job {
                quit: false,
                pending_input: None,
                output: None,
            }),
            cond: Condvar::new(),
        })
    }
}

/// A handle identifying which worker a page was submitted to, so the
/// caller can later collect that specific result.
pub struct Ticket(usize);

fn spawn_compress_worker(worker: Arc<Worker>, level: u32) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("aero-ram-migrate-compress".into())
        .spawn(move || loop {
            let mut job = worker.mutex.lock().unwrap();
            loop {
                if job.quit {
                    return;
                }
                if job.pending_input.is_some() {
                    break;
                }
                job = worker.cond.wait(job).unwrap();
            }
            let input = job.pending_input.take().unwrap();
            drop(job);

            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level));
            let compressed = encoder
                .write_all(&input)
                .and_then(|_| encoder.finish())
                .unwrap_or_default();

            let mut job = worker.mutex.lock().unwrap();
            job.output = Some(compressed);
            worker.cond.notify_all();
        })
        .expect("failed to spawn compression worker thread")
}

fn spawn_decompress_worker(worker: Arc<Worker>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("aero-ram-migrate-decompress".into())
        .spawn(move || loop {
            let mut job = worker.mutex.lock().unwrap();
            loop {
                if job.quit {
                    return;
                }
                if job.pending_input.is_some() {
                    break;
                }
                job = worker.cond.wait(job).unwrap();
            }
            let input = job.pending_input.take().unwrap();
            drop(job);

            let mut decoder = ZlibDecoder::new(Vec::new());
            let decompressed = decoder
                .write_all(&input)
                .and_then(|_| decoder.finish())
                .unwrap_or_default();

            let mut job = worker.mutex.lock().unwrap();
            job.output = Some(decompressed);
            worker.cond.notify_all();
        })
        .expect("failed to spawn decompression worker thread")
}

macro_rules! pool_impl {
    ($name:ident, $spawn:ident) => {
        pub struct $name {
            workers: Vec<Arc<Worker>>,
            handles: Vec<JoinHandle<()>>,
            next: AtomicUsize,
        }

        impl $name {
            pub fn new(n_threads: usize, level: u32) -> Self {
                let n = n_threads.max(1);
                let workers: Vec<_> = (0..n).map(|_| Worker::new()).collect();
                let handles = workers
                    .iter()
                    .cloned()
                    .map(|w| $spawn(w, level))
                    .collect();
                Self {
                    workers,
                    handles,
                    next: AtomicUsize::new(0),
                }
            }

            pub fn worker_count(&self) -> usize {
                self.workers.len()
            }

            /// Blocks only if the chosen worker's previous job hasn't been
            /// collected yet; otherwise returns as soon as the job is queued.
            pub fn submit(&self, data: Vec<u8>) -> Ticket {
                let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
                let worker = &self.workers[idx];
                let mut job = worker.mutex.lock().unwrap();
                job = worker
                    .cond
                    .wait_while(job, |j| j.pending_input.is_some() || j.output.is_some())
                    .unwrap();
                job.pending_input = Some(data);
                worker.cond.notify_all();
                Ticket(idx)
            }

            /// Blocks until the worker identified by `ticket` has produced
            /// its result.
            pub fn collect(&self, ticket: Ticket) -> Vec<u8> {
                let worker = &self.workers[ticket.0];
                let mut job = worker.mutex.lock().unwrap();
                job = worker.cond.wait_while(job, |j| j.output.is_none()).unwrap();
                job.output.take().unwrap()
            }

            /// Blocks until every worker is idle, i.e. has no submitted job
            /// awaiting collection. Callers that submit-then-collect in
            /// lockstep (as the scanner does) never leave a job pending, so
            /// this is a boundary checkpoint rather than a real drain.
            pub fn flush_all(&self) {
                for worker in &self.workers {
                    let job = worker.mutex.lock().unwrap();
                    let _ = worker
                        .cond
                        .wait_while(job, |j| j.pending_input.is_some() || j.output.is_some())
                        .unwrap();
                }
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                for worker in &self.workers {
                    let mut job = worker.mutex.lock().unwrap();
                    job.quit = true;
                    worker.cond.notify_all();
                }
                for handle in self.handles.drain(..) {
                    let _ = handle.join();
                }
            }
        }
    };
}

pool_impl!(CompressWorkerPool, spawn_compress_worker);
pool_impl!(DecompressWorkerPool, spawn_decompress_worker);
