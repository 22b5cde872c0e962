//! Pool of worker processes, one driver thread per child

use std::io::{self, BufReader, BufWriter, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use pipeinfer_core::{Error, Result, WorkerCommand};

use super::protocol::{read_frame, write_frame};

/// Callback receiving a worker's raw response, or the reason there is none
pub(crate) type Reply = Box<dyn FnOnce(Result<Vec<u8>>) + Send>;

/// Encoded request plus where its answer goes
pub(crate) struct ProcessJob {
    pub(crate) request: Vec<u8>,
    pub(crate) reply: Reply,
}

/// A fixed set of worker processes speaking the frame protocol.
///
/// Each child gets a driver thread that takes jobs from a shared queue,
/// writes the request to the child's stdin and reads the response from its
/// stdout. A child that dies fails the job it was running; once every
/// child is gone, queued and new jobs fail with
/// [`Error::ExecutorResource`]. Other pools are unaffected.
pub struct ProcessPool {
    size: usize,
    jobs: RwLock<Option<Sender<ProcessJob>>>,
    drivers: Mutex<Vec<JoinHandle<()>>>,
    alive: Arc<AtomicUsize>,
}

fn unavailable() -> Error {
    Error::resource("no live worker processes")
}

impl ProcessPool {
    /// Launch `size` copies of `command`
    pub fn spawn(command: &WorkerCommand, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::setup("process pool needs at least one worker"));
        }
        let (sender, receiver) = channel::bounded::<ProcessJob>(size * 2);
        let alive = Arc::new(AtomicUsize::new(0));
        let mut drivers = Vec::with_capacity(size);

        for worker in 0..size {
            let mut child = Command::new(&command.program)
                .args(&command.args)
                .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .spawn()
                .map_err(|e| {
                    Error::resource(format!(
                        "failed to launch worker {}: {e}",
                        command.program.display()
                    ))
                })?;
            let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
                let _ = child.kill();
                return Err(Error::resource("worker process has no stdio pipes"));
            };

            alive.fetch_add(1, Ordering::AcqRel);
            let driver = Driver {
                worker,
                child,
                writer: BufWriter::new(stdin),
                reader: BufReader::new(stdout),
                jobs: receiver.clone(),
                alive: Arc::clone(&alive),
            };
            let handle = thread::Builder::new()
                .name(format!("pipeinfer-process-driver-{worker}"))
                .spawn(move || driver.run())
                .map_err(|e| Error::resource(format!("failed to spawn driver thread: {e}")))?;
            drivers.push(handle);
        }
        tracing::info!(program = %command.program.display(), size, "process pool started");

        Ok(Self {
            size,
            jobs: RwLock::new(Some(sender)),
            drivers: Mutex::new(drivers),
            alive,
        })
    }

    /// Number of workers launched
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of workers still running
    pub fn alive(&self) -> usize {
        self.alive.load(Ordering::Acquire)
    }

    /// Queue a job; on failure its reply has already been called
    pub(crate) fn submit(&self, job: ProcessJob) -> Result<()> {
        let sender = match self.jobs.read() {
            Ok(jobs) => jobs.clone(),
            Err(_) => None,
        };
        let Some(sender) = sender else {
            (job.reply)(Err(Error::resource("process pool is shut down")));
            return Err(Error::resource("process pool is shut down"));
        };
        if self.alive() == 0 {
            (job.reply)(Err(unavailable()));
            return Err(unavailable());
        }
        sender.send(job).map_err(|rejected| {
            (rejected.into_inner().reply)(Err(unavailable()));
            unavailable()
        })
    }

    /// Close the queue, let workers finish their current job and exit
    pub fn shutdown(&self) {
        if let Ok(mut jobs) = self.jobs.write() {
            jobs.take();
        }
        let drivers = match self.drivers.lock() {
            Ok(mut drivers) => std::mem::take(&mut *drivers),
            Err(_) => return,
        };
        for handle in drivers {
            if handle.join().is_err() {
                tracing::error!("process driver thread panicked");
            }
        }
    }
}

impl Drop for ProcessPool {
    fn drop(&mut self) {
        if let Ok(mut jobs) = self.jobs.write() {
            jobs.take();
        }
    }
}

struct Driver {
    worker: usize,
    child: Child,
    writer: BufWriter<ChildStdin>,
    reader: BufReader<ChildStdout>,
    jobs: Receiver<ProcessJob>,
    alive: Arc<AtomicUsize>,
}

impl Driver {
    fn run(mut self) {
        let mut crashed = false;
        while let Ok(job) = self.jobs.recv() {
            match self.exchange(&job.request) {
                Ok(response) => (job.reply)(Ok(response)),
                Err(err) => {
                    tracing::error!(worker = self.worker, error = %err, "worker process failed");
                    (job.reply)(Err(Error::resource(format!(
                        "worker process {} failed: {err}",
                        self.worker
                    ))));
                    crashed = true;
                    break;
                }
            }
        }

        let Driver {
            worker,
            mut child,
            writer,
            jobs,
            alive,
            ..
        } = self;
        // Closing stdin tells a healthy worker to exit.
        drop(writer);
        if crashed {
            let _ = child.kill();
        }
        match child.wait() {
            Ok(status) => tracing::debug!(worker, %status, "worker process exited"),
            Err(err) => tracing::warn!(worker, error = %err, "failed to reap worker process"),
        }

        if alive.fetch_sub(1, Ordering::AcqRel) == 1 {
            while let Ok(job) = jobs.try_recv() {
                (job.reply)(Err(unavailable()));
            }
        }
    }

    fn exchange(&mut self, request: &[u8]) -> io::Result<Vec<u8>> {
        write_frame(&mut self.writer, request)?;
        self.writer.flush()?;
        read_frame(&mut self.reader)?
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "worker closed its output"))
    }
}
