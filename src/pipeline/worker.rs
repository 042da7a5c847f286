//! Render worker - the producer side of a session
//!
//! Runs either in a dedicated child process (`pagestream worker`) or on a
//! thread; both drive the same state machine over the same wire protocol.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use log::{debug, error, info, warn};

use super::buffer::SharedFrameBuffer;
use super::channel::WorkerChannel;
use super::engine::{DocumentEngine, PageSource};
use super::error::{FailureKind, PipelineError, Result};
use super::focus::ScrollFocusChannel;
use super::pending::PendingPages;
use super::protocol::{AckOrAbort, FrameNotice};
use super::region::{ExitRecord, SessionStatus, SharedRegion};
use crate::settings::RenderFailurePolicy;

/// Worker-internal session state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProducerState {
    /// Document open, nothing selected yet
    Idle,
    /// Rasterizing a page
    Rendering(usize),
    /// Frame is in the buffer; announce it and block for the reply
    AwaitingAck(FrameNotice),
    /// Pending set exhausted
    Finished,
    /// Consumer asked to stop
    Interrupted,
    /// Session-fatal error
    Failed {
        kind: FailureKind,
        page: Option<usize>,
    },
}

impl ProducerState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Interrupted | Self::Failed { .. }
        )
    }
}

/// Renders every page of one document exactly once, in focus-aware order,
/// one frame in flight at a time.
pub struct RenderWorker<R, W> {
    source: Box<dyn PageSource>,
    pending: PendingPages,
    region: Arc<SharedRegion>,
    buffer: SharedFrameBuffer,
    focus: ScrollFocusChannel,
    channel: WorkerChannel<R, W>,
    policy: RenderFailurePolicy,
    skipped: u32,
}

impl<R: Read, W: Write> RenderWorker<R, W> {
    pub fn new(
        source: Box<dyn PageSource>,
        region: Arc<SharedRegion>,
        channel: WorkerChannel<R, W>,
        policy: RenderFailurePolicy,
    ) -> Self {
        let pending = PendingPages::new(source.page_count());
        Self {
            source,
            pending,
            buffer: SharedFrameBuffer::new(Arc::clone(&region)),
            focus: ScrollFocusChannel::new(Arc::clone(&region)),
            region,
            channel,
            policy,
            skipped: 0,
        }
    }

    /// Drives the session to a terminal state, publishes the exit record and
    /// releases the channel and mapping.
    pub fn run(mut self) -> ExitRecord {
        let mut state = ProducerState::Idle;
        while !state.is_terminal() {
            state = self.step(state);
        }

        let record = self.exit_record(state);
        self.region.publish_exit(&record);
        info!(
            "render worker done: {:?}, {} pages remaining, {} skipped",
            record.status, record.remaining, record.skipped
        );
        record
    }

    fn step(&mut self, state: ProducerState) -> ProducerState {
        match state {
            ProducerState::Idle => match self.pending.first(self.focus.take()) {
                Some(page) => ProducerState::Rendering(page),
                None => ProducerState::Finished,
            },

            ProducerState::Rendering(page) => match self.source.render(page) {
                Ok(bytes) => match self.buffer.write(&bytes) {
                    Ok(length) => {
                        debug!("page {page}: {length} bytes in buffer");
                        ProducerState::AwaitingAck(FrameNotice::new(length, page as u32))
                    }
                    Err(e) => {
                        error!("page {page}: {e}");
                        ProducerState::Failed {
                            kind: e.failure_kind(),
                            page: Some(page),
                        }
                    }
                },
                Err(e) => match self.policy {
                    RenderFailurePolicy::AbortSession => {
                        error!("{e}, ending session");
                        ProducerState::Failed {
                            kind: FailureKind::Render,
                            page: Some(page),
                        }
                    }
                    RenderFailurePolicy::SkipPage => {
                        warn!("{e}, skipping page");
                        self.pending.remove(page);
                        self.skipped += 1;
                        self.select_after(page)
                    }
                },
            },

            ProducerState::AwaitingAck(notice) => {
                let page = notice.page_index as usize;
                let reply = self
                    .channel
                    .notify(notice)
                    .and_then(|pending| pending.wait());

                match reply {
                    Ok(AckOrAbort::Ack) => {
                        self.pending.remove(page);
                        self.select_after(page)
                    }
                    Ok(AckOrAbort::Abort) => {
                        info!("abort received while page {page} was awaiting ack");
                        ProducerState::Interrupted
                    }
                    Err(PipelineError::ChannelClosed) => {
                        warn!("consumer hung up while page {page} was awaiting ack");
                        ProducerState::Interrupted
                    }
                    Err(e) => {
                        error!("handshake for page {page} failed: {e}");
                        ProducerState::Failed {
                            kind: e.failure_kind(),
                            page: Some(page),
                        }
                    }
                }
            }

            terminal => terminal,
        }
    }

    fn select_after(&self, current: usize) -> ProducerState {
        let focus = self.focus.take();
        match self.pending.next_after(current, focus) {
            Some(next) => {
                if focus == Some(next) {
                    debug!("focus jump to page {next}");
                }
                ProducerState::Rendering(next)
            }
            None => ProducerState::Finished,
        }
    }

    fn exit_record(&self, state: ProducerState) -> ExitRecord {
        let (status, failure, failed_page) = match state {
            ProducerState::Finished => (SessionStatus::Finished, None, None),
            ProducerState::Interrupted => (SessionStatus::Interrupted, None, None),
            ProducerState::Failed { kind, page } => (
                SessionStatus::Failed,
                Some(kind),
                page.map(|p| p as u32),
            ),
            _ => (SessionStatus::Running, None, None),
        };

        ExitRecord {
            status,
            failure,
            failed_page,
            remaining: self.pending.len() as u32,
            skipped: self.skipped,
        }
    }
}

/// Worker entry point: maps the region, opens the document and renders until
/// the session ends. Errors are returned only when the region itself cannot
/// be opened; everything else is reported through the exit record.
pub fn run_worker<R: Read, W: Write>(
    engine: &dyn DocumentEngine,
    document: &Path,
    region_name: &str,
    channel: WorkerChannel<R, W>,
    policy: RenderFailurePolicy,
) -> Result<ExitRecord> {
    let region = Arc::new(SharedRegion::open(region_name).map_err(PipelineError::SharedMemory)?);

    let source = match engine.open(document) {
        Ok(source) if u32::try_from(source.page_count()).is_ok() => source,
        Ok(source) => {
            error!("{document:?} has {} pages, too many to index", source.page_count());
            return Ok(publish_open_failure(&region));
        }
        Err(e) => {
            error!("{e}");
            return Ok(publish_open_failure(&region));
        }
    };

    info!(
        "rendering {} pages of {document:?} into {region_name}",
        source.page_count()
    );

    Ok(RenderWorker::new(source, region, channel, policy).run())
}

fn publish_open_failure(region: &SharedRegion) -> ExitRecord {
    let record = ExitRecord {
        status: SessionStatus::Failed,
        failure: Some(FailureKind::DocumentOpen),
        failed_page: None,
        remaining: 0,
        skipped: 0,
    };
    region.publish_exit(&record);
    record
}
