//! Starting render workers
//!
//! Production workers are child processes of the current executable talking
//! over stdin/stdout. The thread launcher runs the same worker over a Unix
//! socket pair, with an injected engine.

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use super::channel::WorkerChannel;
use super::engine::DocumentEngine;
use super::error::{PipelineError, Result};
use super::worker::run_worker;
use crate::settings::RenderFailurePolicy;

const JOIN_POLL: Duration = Duration::from_millis(10);

/// Everything a worker needs to find its session.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkerSpec {
    pub document: PathBuf,
    pub region_name: String,
    pub render_scale: f32,
    pub on_render_error: RenderFailurePolicy,
}

/// Consumer end of a freshly launched worker
pub struct WorkerLink {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub handle: WorkerHandle,
}

pub enum WorkerHandle {
    Process(Child),
    Thread(JoinHandle<()>),
}

impl WorkerHandle {
    /// Non-blocking. For a process this is `try_wait`, which reaps an exited
    /// child and so needs `&mut`.
    pub fn is_alive(&mut self) -> bool {
        match self {
            Self::Process(child) => matches!(child.try_wait(), Ok(None)),
            Self::Thread(handle) => !handle.is_finished(),
        }
    }

    /// Waits for the worker to exit. A child process still running after
    /// `timeout` is killed. Threads cannot be killed and are joined.
    pub fn join(self, timeout: Duration) -> Result<()> {
        match self {
            Self::Process(mut child) => {
                let deadline = Instant::now() + timeout;
                loop {
                    if let Some(status) = child.try_wait()? {
                        if !status.success() {
                            warn!("render worker {} exited with {status}", child.id());
                        }
                        return Ok(());
                    }
                    if Instant::now() >= deadline {
                        warn!(
                            "render worker {} still running after {timeout:?}, killing",
                            child.id()
                        );
                        let _ = child.kill();
                        child.wait()?;
                        return Ok(());
                    }
                    thread::sleep(JOIN_POLL);
                }
            }
            Self::Thread(handle) => handle.join().map_err(|_| PipelineError::WorkerPanicked),
        }
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Process(child) => write!(f, "WorkerHandle::Process({})", child.id()),
            Self::Thread(handle) => write!(f, "WorkerHandle::Thread({:?})", handle.thread().name()),
        }
    }
}

pub trait WorkerLauncher: Send {
    fn launch(&self, spec: &WorkerSpec) -> Result<WorkerLink>;
}

/// Spawns `<program> worker ...` with the control channel on stdin/stdout.
#[derive(Clone, Debug)]
pub struct ProcessLauncher {
    program: PathBuf,
    config: Option<PathBuf>,
    log_file: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            config: None,
            log_file: None,
        }
    }

    /// Launcher that re-executes the running binary.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Workers read this settings file instead of the default one.
    #[must_use]
    pub fn with_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.config = Some(path.into());
        self
    }

    /// Workers append to this log file instead of the default one.
    #[must_use]
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, spec: &WorkerSpec) -> Result<WorkerLink> {
        let mut command = Command::new(&self.program);
        if let Some(config) = &self.config {
            command.arg("--config").arg(config);
        }
        if let Some(log_file) = &self.log_file {
            command.arg("--log-file").arg(log_file);
        }
        command
            .arg("worker")
            .arg("--document")
            .arg(&spec.document)
            .arg("--region")
            .arg(&spec.region_name)
            .arg("--scale")
            .arg(spec.render_scale.to_string())
            .arg("--on-render-error")
            .arg(spec.on_render_error.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = command.spawn()?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(io::Error::other("worker stdio was not captured").into());
        };

        info!(
            "spawned render worker pid {} for {:?}",
            child.id(),
            spec.document
        );

        Ok(WorkerLink {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            handle: WorkerHandle::Process(child),
        })
    }
}

/// Runs the worker on a thread of this process.
pub struct ThreadLauncher {
    engine: Arc<dyn DocumentEngine>,
}

impl ThreadLauncher {
    pub fn new(engine: Arc<dyn DocumentEngine>) -> Self {
        Self { engine }
    }
}

impl WorkerLauncher for ThreadLauncher {
    fn launch(&self, spec: &WorkerSpec) -> Result<WorkerLink> {
        let (consumer_end, worker_end) = UnixStream::pair()?;
        let consumer_reader = consumer_end.try_clone()?;
        let worker_reader = worker_end.try_clone()?;

        let engine = Arc::clone(&self.engine);
        let spec = spec.clone();
        let handle = thread::Builder::new()
            .name("render-worker".to_string())
            .spawn(move || {
                let channel = WorkerChannel::new(worker_reader, worker_end);
                match run_worker(
                    engine.as_ref(),
                    &spec.document,
                    &spec.region_name,
                    channel,
                    spec.on_render_error,
                ) {
                    Ok(record) => debug!("render worker thread exited: {record:?}"),
                    Err(e) => error!("render worker thread could not start: {e}"),
                }
            })?;

        Ok(WorkerLink {
            reader: Box::new(consumer_reader),
            writer: Box::new(consumer_end),
            handle: WorkerHandle::Thread(handle),
        })
    }
}
