//! Consumer-side handle owning at most one render session
//!
//! Lifecycle: `start` → `poll`* → `stop`. The handle never blocks in `poll`;
//! it drains whatever the notice pump has queued and returns.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};

use super::buffer::SharedFrameBuffer;
use super::channel::{ChannelEvent, ConsumerChannel};
use super::engine::DocumentEngine;
use super::error::{FailureKind, PipelineError, Result};
use super::focus::ScrollFocusChannel;
use super::launcher::{WorkerHandle, WorkerLauncher, WorkerLink, WorkerSpec};
use super::protocol::AckOrAbort;
use super::region::{SessionStatus, SharedRegion};
use crate::settings::PipelineSettings;

/// One delivered page
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub page_index: usize,
    pub bytes: Vec<u8>,
}

impl Frame {
    #[must_use]
    pub fn length(&self) -> usize {
        self.bytes.len()
    }
}

/// How a session ended, as seen by the consumer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Every page was delivered or skipped
    Completed,
    /// Aborted by the consumer
    Interrupted,
    Failed {
        kind: FailureKind,
        page: Option<usize>,
    },
    /// The worker reported a finish with pages neither delivered nor skipped
    Incomplete,
    /// The worker went away without publishing an exit record
    WorkerLost,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionReport {
    pub document: PathBuf,
    pub page_count: usize,
    pub delivered: usize,
    pub remaining: usize,
    pub skipped: usize,
    pub outcome: SessionOutcome,
}

impl SessionReport {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome == SessionOutcome::Completed
    }
}

#[derive(Debug)]
pub enum PollOutcome {
    /// No session, or the session has stopped polling
    Idle,
    /// Nothing ready yet
    Pending,
    Frame(Frame),
    /// The worker has ended; polling stops
    Finished(SessionReport),
}

/// Everything owned by one worker lifetime
pub struct ProducerSession {
    document: PathBuf,
    page_count: usize,
    worker: Option<WorkerHandle>,
    region: Arc<SharedRegion>,
    buffer: SharedFrameBuffer,
    focus: ScrollFocusChannel,
    channel: ConsumerChannel,
    delivered: BTreeSet<usize>,
    polling: bool,
}

impl ProducerSession {
    pub fn document(&self) -> &Path {
        &self.document
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn region_name(&self) -> &str {
        self.region.name()
    }

    /// Pages delivered so far, in index order
    pub fn delivered(&self) -> impl Iterator<Item = usize> + '_ {
        self.delivered.iter().copied()
    }

    pub fn is_polling(&self) -> bool {
        self.polling
    }

    fn receive(&mut self) -> Result<PollOutcome> {
        match self.channel.poll_event()? {
            None => Ok(PollOutcome::Pending),
            Some(ChannelEvent::HungUp) => {
                self.polling = false;
                let report = self.report();
                info!("render session for {:?} ended: {:?}", self.document, report.outcome);
                Ok(PollOutcome::Finished(report))
            }
            Some(ChannelEvent::Frame(notice)) => {
                let page = notice.page_index as usize;
                if page >= self.page_count {
                    return Err(PipelineError::protocol(format!(
                        "frame for page {page} of a {}-page document",
                        self.page_count
                    )));
                }
                if self.delivered.contains(&page) {
                    return Err(PipelineError::protocol(format!(
                        "page {page} delivered twice"
                    )));
                }

                let bytes = self.buffer.copy_out(notice.length as usize)?;
                self.channel.reply(AckOrAbort::Ack)?;
                self.delivered.insert(page);
                debug!("received page {page} ({} bytes)", bytes.len());

                Ok(PollOutcome::Frame(Frame {
                    page_index: page,
                    bytes,
                }))
            }
        }
    }

    fn report(&self) -> SessionReport {
        let record = self.region.exit_record();
        let delivered = self.delivered.len();
        let skipped = record.skipped as usize;

        let outcome = match record.status {
            SessionStatus::Finished if delivered + skipped >= self.page_count => {
                SessionOutcome::Completed
            }
            SessionStatus::Finished => SessionOutcome::Incomplete,
            SessionStatus::Interrupted => SessionOutcome::Interrupted,
            SessionStatus::Failed => SessionOutcome::Failed {
                kind: record.failure.unwrap_or(FailureKind::Channel),
                page: record.failed_page.map(|p| p as usize),
            },
            SessionStatus::Running => SessionOutcome::WorkerLost,
        };

        let remaining = if record.status.is_terminal() {
            record.remaining as usize
        } else {
            self.page_count.saturating_sub(delivered + skipped)
        };

        SessionReport {
            document: self.document.clone(),
            page_count: self.page_count,
            delivered,
            remaining,
            skipped,
            outcome,
        }
    }
}

impl std::fmt::Debug for ProducerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerSession")
            .field("document", &self.document)
            .field("page_count", &self.page_count)
            .field("region", &self.region)
            .field("delivered", &self.delivered.len())
            .field("polling", &self.polling)
            .finish_non_exhaustive()
    }
}

/// Viewer-facing handle: starts, drains and tears down render workers.
pub struct PageProducer {
    engine: Arc<dyn DocumentEngine>,
    launcher: Box<dyn WorkerLauncher>,
    settings: PipelineSettings,
    session: Option<ProducerSession>,
}

impl PageProducer {
    /// `engine` is used here only to probe the page count; the worker opens
    /// the document on its own.
    pub fn new(
        engine: Arc<dyn DocumentEngine>,
        launcher: Box<dyn WorkerLauncher>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            engine,
            launcher,
            settings,
            session: None,
        }
    }

    /// Opens `path`, allocates a region and launches a worker for it.
    /// Returns the page count.
    pub fn start(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        if self.session.is_some() {
            return Err(PipelineError::SessionAlive);
        }

        let page_count = self.engine.open(path)?.page_count();

        let region_name = SharedRegion::unique_name();
        let region = Arc::new(
            SharedRegion::create(&region_name, self.settings.frame_buffer_bytes)
                .map_err(PipelineError::SharedMemory)?,
        );

        let spec = WorkerSpec {
            document: path.to_path_buf(),
            region_name,
            render_scale: self.settings.render_scale,
            on_render_error: self.settings.on_render_error,
        };
        let WorkerLink {
            reader,
            writer,
            handle,
        } = self.launcher.launch(&spec)?;

        let channel = match ConsumerChannel::spawn(reader, writer) {
            Ok(channel) => channel,
            Err(e) => {
                // The worker sees its channel closed and interrupts itself
                if let Err(join_err) = handle.join(self.settings.teardown_timeout()) {
                    warn!("worker teardown after failed start: {join_err}");
                }
                return Err(e.into());
            }
        };

        info!(
            "render session started for {path:?}: {page_count} pages, region {}",
            region.name()
        );

        self.session = Some(ProducerSession {
            document: path.to_path_buf(),
            page_count,
            worker: Some(handle),
            buffer: SharedFrameBuffer::new(Arc::clone(&region)),
            focus: ScrollFocusChannel::new(Arc::clone(&region)),
            region,
            channel,
            delivered: BTreeSet::new(),
            polling: true,
        });

        Ok(page_count)
    }

    /// Tears down the current session, if any, and starts one for `path`.
    pub fn restart(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        self.stop();
        self.start(path)
    }

    /// Non-blocking drain step. Returns at most one frame per call.
    ///
    /// A frame for an out-of-range or already delivered page is a protocol
    /// violation: the worker is told to abort, polling stops and the error is
    /// returned. The session stays in place until [`stop`](Self::stop).
    pub fn poll(&mut self) -> Result<PollOutcome> {
        let Some(session) = self.session.as_mut().filter(|s| s.polling) else {
            return Ok(PollOutcome::Idle);
        };

        session.receive().inspect_err(|e| {
            error!("render session for {:?} broken: {e}", session.document);
            session.polling = false;
            if let Err(abort_err) = session.channel.reply(AckOrAbort::Abort) {
                debug!("abort not delivered: {abort_err}");
            }
        })
    }

    /// Asks the worker to render `page` next. No-op without a session.
    pub fn request_focus(&self, page: usize) {
        if let Some(session) = &self.session {
            debug!("focus requested for page {page}");
            session.focus.request(page);
        }
    }

    /// Aborts the worker, waits for it to exit and releases the session.
    /// Returns the final report, or `None` when no session was alive.
    pub fn stop(&mut self) -> Option<SessionReport> {
        let mut session = self.session.take()?;

        if let Err(e) = session.channel.reply(AckOrAbort::Abort) {
            debug!("abort not delivered: {e}");
        }

        if let Some(worker) = session.worker.take() {
            if let Err(e) = worker.join(self.settings.teardown_timeout()) {
                error!("render worker teardown: {e}");
            }
        }

        let report = session.report();
        session.channel.close();
        info!(
            "render session for {:?} stopped: {:?}, {} of {} pages delivered",
            report.document, report.outcome, report.delivered, report.page_count
        );

        Some(report)
    }

    /// Whether the session's worker is still running. Takes `&mut self`
    /// because checking a child process reaps it once it has exited.
    pub fn is_alive(&mut self) -> bool {
        self.session
            .as_mut()
            .and_then(|s| s.worker.as_mut())
            .is_some_and(WorkerHandle::is_alive)
    }

    pub fn session(&self) -> Option<&ProducerSession> {
        self.session.as_ref()
    }

    pub fn poll_interval(&self) -> Duration {
        self.settings.poll_interval()
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }
}

impl Drop for PageProducer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::launcher::ThreadLauncher;
    use crate::test_utils::{ScriptedEngine, drain, test_settings};

    fn producer(engine: ScriptedEngine) -> PageProducer {
        let engine: Arc<dyn DocumentEngine> = Arc::new(engine);
        PageProducer::new(
            Arc::clone(&engine),
            Box::new(ThreadLauncher::new(engine)),
            test_settings(),
        )
    }

    #[test]
    fn idle_without_session() {
        let mut producer = producer(ScriptedEngine::new());

        assert!(matches!(producer.poll(), Ok(PollOutcome::Idle)));
        assert!(!producer.is_alive());
        assert!(producer.stop().is_none());
        producer.request_focus(3);
    }

    #[test]
    fn finished_session_stops_polling_but_stays_until_stop() {
        let mut producer = producer(ScriptedEngine::new().with_document("a.pdf", 2));
        producer.start("a.pdf").unwrap();

        let (pages, report) = drain(&mut producer);

        assert_eq!(pages, vec![0, 1]);
        assert_eq!(report.outcome, SessionOutcome::Completed);
        assert!(matches!(producer.poll(), Ok(PollOutcome::Idle)));
        assert!(producer.session().is_some());
        assert!(matches!(producer.start("a.pdf"), Err(PipelineError::SessionAlive)));

        let report = producer.stop().expect("session");
        assert_eq!(report.outcome, SessionOutcome::Completed);
        assert!(producer.session().is_none());
    }

    #[test]
    fn restart_switches_documents() {
        let engine = ScriptedEngine::new()
            .with_document("a.pdf", 3)
            .with_document("b.pdf", 1);
        let mut producer = producer(engine);

        producer.start("a.pdf").unwrap();
        assert_eq!(producer.restart("b.pdf").unwrap(), 1);

        let session = producer.session().expect("session");
        assert_eq!(session.document(), Path::new("b.pdf"));
        let (pages, report) = drain(&mut producer);
        assert_eq!(pages, vec![0]);
        assert!(report.is_success());
    }

    #[test]
    fn zero_page_document_completes_immediately() {
        let mut producer = producer(ScriptedEngine::new().with_document("empty.pdf", 0));

        assert_eq!(producer.start("empty.pdf").unwrap(), 0);
        let (pages, report) = drain(&mut producer);

        assert!(pages.is_empty());
        assert_eq!(report.outcome, SessionOutcome::Completed);
    }
}
