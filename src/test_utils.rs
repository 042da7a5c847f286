//! Test doubles for the render pipeline: a scripted document engine, a gate
//! that holds renders until the test lets them through, and drain helpers.

use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use flume::{Receiver, Sender};
use image::{ImageFormat, Rgb, RgbImage};

use crate::pipeline::{
    DocumentEngine, DocumentOpenError, Frame, PageProducer, PageSource, PipelineError,
    PollOutcome, RenderError, RenderOutcome, SessionReport, ThreadLauncher, WorkerLauncher,
    WorkerLink, WorkerSpec,
};
use crate::settings::PipelineSettings;

/// Upper bound on any wait in a test helper, so a broken pipeline fails the
/// test instead of hanging it.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings for in-process sessions: small buffer, fast teardown.
pub fn test_settings() -> PipelineSettings {
    PipelineSettings {
        frame_buffer_bytes: 64 * 1024,
        poll_interval_ms: 1,
        teardown_timeout_ms: 2000,
        ..PipelineSettings::default()
    }
}

/// Raw payload for `page`: 32 bytes tagged with the page index, so a test can
/// tell which page a frame holds.
pub fn page_payload(page: usize) -> Vec<u8> {
    let mut bytes = (page as u32).to_le_bytes().to_vec();
    bytes.resize(32, page as u8);
    bytes
}

/// Page index encoded by [`page_payload`]
pub fn payload_page(bytes: &[u8]) -> Option<usize> {
    let tag: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(tag) as usize)
}

/// A small PNG whose red channel carries the page index.
pub fn page_png(page: usize) -> Vec<u8> {
    let image = RgbImage::from_pixel(4, 6, Rgb([page as u8, 0x40, 0x80]));
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .expect("encode test png");
    out.into_inner()
}

#[derive(Clone, Debug, Default)]
struct ScriptedDocument {
    page_count: usize,
    failing: HashSet<usize>,
    oversized: HashMap<usize, usize>,
    png: bool,
}

/// Pages whose render has started, in order
#[derive(Clone, Debug, Default)]
pub struct RenderLog(Arc<Mutex<Vec<usize>>>);

impl RenderLog {
    pub fn pages(&self) -> Vec<usize> {
        self.0.lock().expect("render log poisoned").clone()
    }

    fn push(&self, page: usize) {
        self.0.lock().expect("render log poisoned").push(page);
    }
}

/// Document engine with canned documents keyed by path.
#[derive(Clone, Default)]
pub struct ScriptedEngine {
    documents: HashMap<PathBuf, ScriptedDocument>,
    gate: Option<RenderGate>,
    log: RenderLog,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(mut self, path: impl Into<PathBuf>, page_count: usize) -> Self {
        self.documents.insert(
            path.into(),
            ScriptedDocument {
                page_count,
                ..ScriptedDocument::default()
            },
        );
        self
    }

    pub fn failing_page(mut self, path: impl AsRef<Path>, page: usize) -> Self {
        self.document_mut(path).failing.insert(page);
        self
    }

    /// `page` renders to `len` bytes of filler.
    pub fn oversized_page(mut self, path: impl AsRef<Path>, page: usize, len: usize) -> Self {
        self.document_mut(path).oversized.insert(page, len);
        self
    }

    /// Pages render to [`page_png`] instead of [`page_payload`].
    pub fn png_pages(mut self, path: impl AsRef<Path>) -> Self {
        self.document_mut(path).png = true;
        self
    }

    pub fn gated(mut self, gate: RenderGate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn render_log(&self) -> RenderLog {
        self.log.clone()
    }

    fn document_mut(&mut self, path: impl AsRef<Path>) -> &mut ScriptedDocument {
        self.documents
            .get_mut(path.as_ref())
            .expect("declare the document with with_document first")
    }
}

impl DocumentEngine for ScriptedEngine {
    fn open(&self, path: &Path) -> Result<Box<dyn PageSource>, DocumentOpenError> {
        let document = self
            .documents
            .get(path)
            .cloned()
            .ok_or_else(|| DocumentOpenError::new(path, "not a document"))?;

        Ok(Box::new(ScriptedSource {
            document,
            gate: self.gate.clone(),
            log: self.log.clone(),
        }))
    }
}

struct ScriptedSource {
    document: ScriptedDocument,
    gate: Option<RenderGate>,
    log: RenderLog,
}

impl PageSource for ScriptedSource {
    fn page_count(&self) -> usize {
        self.document.page_count
    }

    fn render(&mut self, page_index: usize) -> RenderOutcome {
        self.log.push(page_index);
        if let Some(gate) = &self.gate {
            gate.enter(page_index);
        }

        if self.document.failing.contains(&page_index) {
            return Err(RenderError::new(page_index, "scripted failure"));
        }
        if let Some(&len) = self.document.oversized.get(&page_index) {
            return Ok(vec![0xAB; len]);
        }
        if self.document.png {
            return Ok(page_png(page_index));
        }
        Ok(page_payload(page_index))
    }
}

/// Holds every render until the test releases it.
#[derive(Clone)]
pub struct RenderGate {
    started_tx: Sender<usize>,
    started_rx: Receiver<usize>,
    proceed_tx: Sender<()>,
    proceed_rx: Receiver<()>,
    open: Arc<AtomicBool>,
}

impl Default for RenderGate {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderGate {
    pub fn new() -> Self {
        let (started_tx, started_rx) = flume::unbounded();
        let (proceed_tx, proceed_rx) = flume::unbounded();
        Self {
            started_tx,
            started_rx,
            proceed_tx,
            proceed_rx,
            open: Arc::new(AtomicBool::new(false)),
        }
    }

    fn enter(&self, page: usize) {
        let _ = self.started_tx.send(page);
        if !self.open.load(Ordering::Acquire) {
            let _ = self.proceed_rx.recv_timeout(TEST_TIMEOUT);
        }
    }

    /// Blocks until the next render starts and returns its page.
    pub fn wait_started(&self) -> usize {
        self.started_rx
            .recv_timeout(TEST_TIMEOUT)
            .expect("no render started in time")
    }

    /// Lets one held render finish.
    pub fn proceed(&self) {
        let _ = self.proceed_tx.send(());
    }

    /// Lets the held render and every later one through.
    pub fn open_all(&self) {
        self.open.store(true, Ordering::Release);
        self.proceed();
    }
}

/// Launcher wrapper counting launches
pub struct CountingLauncher<L> {
    inner: L,
    launches: Arc<AtomicUsize>,
}

impl<L: WorkerLauncher> CountingLauncher<L> {
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            launches: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.launches)
    }
}

impl<L: WorkerLauncher> WorkerLauncher for CountingLauncher<L> {
    fn launch(&self, spec: &WorkerSpec) -> Result<WorkerLink, PipelineError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.inner.launch(spec)
    }
}

/// Producer running workers on threads over `engine`, plus its launch counter.
pub fn thread_producer(
    engine: ScriptedEngine,
    settings: PipelineSettings,
) -> (PageProducer, Arc<AtomicUsize>) {
    let engine: Arc<dyn DocumentEngine> = Arc::new(engine);
    let launcher = CountingLauncher::new(ThreadLauncher::new(Arc::clone(&engine)));
    let launches = launcher.counter();
    (
        PageProducer::new(engine, Box::new(launcher), settings),
        launches,
    )
}

/// Polls until the next frame arrives. Panics if the session ends first.
pub fn next_frame(producer: &mut PageProducer) -> Frame {
    let deadline = Instant::now() + TEST_TIMEOUT;
    loop {
        match producer.poll().expect("poll failed") {
            PollOutcome::Frame(frame) => return frame,
            PollOutcome::Pending => {
                assert!(Instant::now() < deadline, "no frame within {TEST_TIMEOUT:?}");
                thread::sleep(Duration::from_millis(1));
            }
            other => panic!("expected a frame, got {other:?}"),
        }
    }
}

/// Polls until the session finishes. Returns the delivered pages in order and
/// the final report.
pub fn drain(producer: &mut PageProducer) -> (Vec<usize>, SessionReport) {
    let deadline = Instant::now() + TEST_TIMEOUT;
    let mut pages = vec![];
    loop {
        match producer.poll().expect("poll failed") {
            PollOutcome::Frame(frame) => pages.push(frame.page_index),
            PollOutcome::Finished(report) => return (pages, report),
            PollOutcome::Pending => {
                assert!(
                    Instant::now() < deadline,
                    "session did not finish within {TEST_TIMEOUT:?}"
                );
                thread::sleep(Duration::from_millis(1));
            }
            PollOutcome::Idle => panic!("no session is polling"),
        }
    }
}
