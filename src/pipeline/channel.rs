//! Control channel endpoints on both sides of the worker boundary

use std::io::{self, ErrorKind, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use flume::{Receiver, Sender, TryRecvError};
use log::{debug, warn};

use super::error::{PipelineError, Result};
use super::protocol::{AckOrAbort, FrameNotice, read_notice, read_reply, write_notice, write_reply};

fn channel_error(err: io::Error) -> PipelineError {
    match err.kind() {
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::UnexpectedEof => {
            PipelineError::ChannelClosed
        }
        _ => PipelineError::Io(err),
    }
}

/// Worker end: announces frames and blocks for exactly one reply each.
pub struct WorkerChannel<R, W> {
    reader: R,
    writer: W,
    outstanding: bool,
}

impl<R: Read, W: Write> WorkerChannel<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            outstanding: false,
        }
    }

    /// Sends `FRAME_READY`. The returned token mutably borrows the channel,
    /// so no second notice can be sent until [`AwaitingReply::wait`] has run.
    pub fn notify(&mut self, notice: FrameNotice) -> Result<AwaitingReply<'_, R, W>> {
        if self.outstanding {
            return Err(PipelineError::protocol(format!(
                "FRAME_READY for page {} sent before the previous frame was answered",
                notice.page_index
            )));
        }

        write_notice(&mut self.writer, notice).map_err(channel_error)?;
        self.outstanding = true;

        Ok(AwaitingReply {
            channel: self,
            notice,
        })
    }
}

/// A frame announced and not yet answered
#[must_use = "an announced frame must be answered before the buffer is reused"]
pub struct AwaitingReply<'a, R, W> {
    channel: &'a mut WorkerChannel<R, W>,
    notice: FrameNotice,
}

impl<R: Read, W: Write> AwaitingReply<'_, R, W> {
    pub fn notice(&self) -> FrameNotice {
        self.notice
    }

    /// Blocks until the consumer answers. This wait is the backpressure that
    /// keeps the buffer single-slot.
    pub fn wait(self) -> Result<AckOrAbort> {
        match read_reply(&mut self.channel.reader) {
            Ok(Some(reply)) => {
                self.channel.outstanding = false;
                Ok(reply)
            }
            Ok(None) => Err(PipelineError::ChannelClosed),
            Err(PipelineError::Io(err)) => Err(channel_error(err)),
            Err(err) => Err(err),
        }
    }
}

/// Something observed on the consumer end
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    Frame(FrameNotice),
    /// The worker closed its end
    HungUp,
}

#[derive(Debug)]
enum Inbound {
    Notice(FrameNotice),
    /// A notice that arrived while the previous one was still unanswered
    Unanswered(FrameNotice),
    Closed,
}

/// Consumer end.
///
/// A pump thread blocks on the worker's output and queues decoded notices, so
/// [`poll_event`](Self::poll_event) never blocks.
pub struct ConsumerChannel {
    inbound: Receiver<Inbound>,
    writer: Option<Box<dyn Write + Send>>,
    outstanding: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
}

impl ConsumerChannel {
    pub fn spawn(reader: Box<dyn Read + Send>, writer: Box<dyn Write + Send>) -> io::Result<Self> {
        let (tx, rx) = flume::unbounded();
        let outstanding = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&outstanding);

        let pump = thread::Builder::new()
            .name("frame-notice-pump".to_string())
            .spawn(move || pump_notices(reader, &tx, &flag))?;

        Ok(Self {
            inbound: rx,
            writer: Some(writer),
            outstanding,
            pump: Some(pump),
        })
    }

    /// Returns the next event if one is queued.
    pub fn poll_event(&mut self) -> Result<Option<ChannelEvent>> {
        match self.inbound.try_recv() {
            Ok(Inbound::Notice(notice)) => Ok(Some(ChannelEvent::Frame(notice))),
            Ok(Inbound::Unanswered(notice)) => Err(PipelineError::protocol(format!(
                "FRAME_READY for page {} arrived before the previous frame was answered",
                notice.page_index
            ))),
            Ok(Inbound::Closed) | Err(TryRecvError::Disconnected) => {
                Ok(Some(ChannelEvent::HungUp))
            }
            Err(TryRecvError::Empty) => Ok(None),
        }
    }

    /// Answers the outstanding notice. An ACK with nothing outstanding is a
    /// protocol violation; an ABORT is accepted at any time.
    pub fn reply(&mut self, reply: AckOrAbort) -> Result<()> {
        match reply {
            AckOrAbort::Ack => {
                if !self.outstanding.swap(false, Ordering::AcqRel) {
                    return Err(PipelineError::protocol(
                        "ACK sent with no outstanding FRAME_READY",
                    ));
                }
            }
            AckOrAbort::Abort => self.outstanding.store(false, Ordering::Release),
        }

        let writer = self.writer.as_mut().ok_or(PipelineError::ChannelClosed)?;
        write_reply(writer, reply).map_err(channel_error)
    }

    /// Drops the write end and waits for the pump to see the worker hang up.
    /// Call only once the worker has exited.
    pub fn close(&mut self) {
        self.writer = None;
        if let Some(pump) = self.pump.take() {
            if pump.join().is_err() {
                warn!("frame notice pump panicked");
            }
        }
    }
}

impl Drop for ConsumerChannel {
    fn drop(&mut self) {
        // The pump exits on its own once the worker's end closes
        self.writer = None;
    }
}

fn pump_notices(mut reader: Box<dyn Read + Send>, tx: &Sender<Inbound>, outstanding: &AtomicBool) {
    loop {
        match read_notice(&mut reader) {
            Ok(Some(notice)) => {
                let message = if outstanding.swap(true, Ordering::AcqRel) {
                    Inbound::Unanswered(notice)
                } else {
                    Inbound::Notice(notice)
                };
                if tx.send(message).is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!("worker closed the control channel");
                let _ = tx.send(Inbound::Closed);
                break;
            }
            Err(e) => {
                warn!("control channel read failed: {e}");
                let _ = tx.send(Inbound::Closed);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;
    use std::time::{Duration, Instant};

    use super::*;

    fn next_event(consumer: &mut ConsumerChannel) -> Result<ChannelEvent> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(event) = consumer.poll_event()? {
                return Ok(event);
            }
            assert!(Instant::now() < deadline, "no channel event within 5s");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn connected() -> (WorkerChannel<UnixStream, UnixStream>, ConsumerChannel) {
        let (worker_end, consumer_end) = UnixStream::pair().expect("socket pair");
        let worker = WorkerChannel::new(worker_end.try_clone().expect("clone"), worker_end);
        let consumer = ConsumerChannel::spawn(
            Box::new(consumer_end.try_clone().expect("clone")),
            Box::new(consumer_end),
        )
        .expect("spawn pump");
        (worker, consumer)
    }

    #[test]
    fn notice_ack_handshake() {
        let (mut worker, mut consumer) = connected();

        let pending = worker.notify(FrameNotice::new(42, 3)).expect("notify");
        assert_eq!(
            next_event(&mut consumer).unwrap(),
            ChannelEvent::Frame(FrameNotice::new(42, 3))
        );
        consumer.reply(AckOrAbort::Ack).expect("ack");

        assert_eq!(pending.wait().expect("reply"), AckOrAbort::Ack);
    }

    #[test]
    fn abort_reaches_waiting_worker() {
        let (mut worker, mut consumer) = connected();

        let pending = worker.notify(FrameNotice::new(1, 0)).expect("notify");
        consumer.reply(AckOrAbort::Abort).expect("abort");

        assert_eq!(pending.wait().expect("reply"), AckOrAbort::Abort);
    }

    #[test]
    fn worker_rejects_second_notice_after_dropped_token() {
        let (mut worker, _consumer) = connected();

        drop(worker.notify(FrameNotice::new(1, 0)).expect("notify"));
        let err = worker
            .notify(FrameNotice::new(1, 1))
            .err()
            .expect("second notice must fail");

        assert!(matches!(err, PipelineError::ProtocolViolation { .. }));
    }

    #[test]
    fn consumer_rejects_ack_without_notice() {
        let (_worker, mut consumer) = connected();

        let err = consumer.reply(AckOrAbort::Ack).expect_err("must fail");

        assert!(matches!(err, PipelineError::ProtocolViolation { .. }));
    }

    #[test]
    fn consumer_flags_unanswered_second_notice() {
        let (mut raw, consumer_end) = UnixStream::pair().expect("socket pair");
        let mut consumer = ConsumerChannel::spawn(
            Box::new(consumer_end.try_clone().expect("clone")),
            Box::new(consumer_end),
        )
        .expect("spawn pump");

        write_notice(&mut raw, FrameNotice::new(1, 0)).unwrap();
        write_notice(&mut raw, FrameNotice::new(1, 1)).unwrap();

        assert!(matches!(
            next_event(&mut consumer),
            Ok(ChannelEvent::Frame(_))
        ));
        assert!(matches!(
            next_event(&mut consumer),
            Err(PipelineError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn worker_sees_closed_channel() {
        let (worker_end, consumer_end) = UnixStream::pair().expect("socket pair");
        let mut worker = WorkerChannel::new(worker_end.try_clone().expect("clone"), worker_end);

        let pending = worker.notify(FrameNotice::new(1, 0)).expect("notify");
        drop(consumer_end);

        assert!(matches!(pending.wait(), Err(PipelineError::ChannelClosed)));
    }

    #[test]
    fn consumer_reports_hang_up() {
        let (worker, mut consumer) = connected();
        drop(worker);

        assert_eq!(next_event(&mut consumer).unwrap(), ChannelEvent::HungUp);
    }
}
