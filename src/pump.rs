//! Flow-controlled, one-directional body coupling
//!
//! A `StreamPump` moves frames from a source body into a bounded channel whose
//! receiving end (`PumpBody`) is handed to hyper as a request or response body.
//! When the channel is full the pump stops reading the source until hyper drains
//! it, so at most `capacity + 1` frames are in memory per direction.

use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, SizeHint};
use hyper::header::{HeaderMap, CONTENT_LENGTH};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::BoxError;

type Item = Result<Frame<Bytes>, BoxError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PumpError {
    /// Reading the source failed
    #[error("source stream failed: {0}")]
    Source(String),

    /// The sink was dropped before the source finished
    #[error("sink closed before end of stream")]
    SinkClosed,

    /// The pump was torn down from outside
    #[error("pump cancelled")]
    Cancelled,
}

/// How a body is delimited on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Length(u64),
    Chunked,
}

impl Framing {
    /// `Length` when the headers carry a valid Content-Length, `Chunked` otherwise
    pub fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Framing::Length)
            .unwrap_or(Framing::Chunked)
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self, Framing::Chunked)
    }
}

/// Counters reported when a pump reaches end of stream
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PumpSummary {
    pub frames: u64,
    pub bytes: u64,
    /// Times the source was paused because the sink was saturated
    pub pauses: u64,
}

/// Sink side of a pump, usable as a hyper body
#[derive(Debug)]
pub struct PumpBody {
    rx: mpsc::Receiver<Item>,
    completed: Arc<AtomicBool>,
    framing: Framing,
    done: bool,
}

impl Body for PumpBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        if self.done {
            return Poll::Ready(None);
        }
        match ready!(self.rx.poll_recv(cx)) {
            Some(Ok(frame)) => Poll::Ready(Some(Ok(frame))),
            Some(Err(e)) => {
                self.done = true;
                Poll::Ready(Some(Err(e)))
            }
            None => {
                self.done = true;
                if self.completed.load(Ordering::Acquire) {
                    Poll::Ready(None)
                } else {
                    // Sender dropped without reaching end of stream (aborted task)
                    Poll::Ready(Some(Err(PumpError::Cancelled.into())))
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.done
    }

    fn size_hint(&self) -> SizeHint {
        match self.framing {
            Framing::Length(len) => SizeHint::with_exact(len),
            Framing::Chunked => SizeHint::default(),
        }
    }
}

/// Source side of a pump; call `start` to begin moving data
pub struct StreamPump<B> {
    source: B,
    tx: mpsc::Sender<Item>,
    completed: Arc<AtomicBool>,
    framing: Framing,
    label: &'static str,
    error_notice: bool,
}

/// Couple `source` to a new sink holding at most `capacity` queued frames
pub fn couple<B>(source: B, framing: Framing, capacity: usize) -> (StreamPump<B>, PumpBody) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let completed = Arc::new(AtomicBool::new(false));
    let pump = StreamPump {
        source,
        tx,
        completed: Arc::clone(&completed),
        framing,
        label: "pump",
        error_notice: false,
    };
    let sink = PumpBody {
        rx,
        completed,
        framing,
        done: false,
    };
    (pump, sink)
}

impl<B> StreamPump<B>
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<BoxError> + Send,
{
    /// Name used in log lines (e.g. "client->backend")
    pub fn with_label(mut self, label: &'static str) -> Self {
        self.label = label;
        self
    }

    /// On source failure, write the error text into the sink before failing it.
    ///
    /// Only chunked sinks carry the notice. A length-delimited sink would count
    /// the notice toward its declared length, so it fails without one.
    pub fn relay_error_notice(mut self) -> Self {
        self.error_notice = true;
        self
    }

    pub fn start(self) -> PumpHandle {
        PumpHandle {
            task: tokio::spawn(self.run()),
        }
    }

    async fn run(mut self) -> Result<PumpSummary, PumpError> {
        let mut summary = PumpSummary::default();

        loop {
            let next = tokio::select! {
                frame = self.source.frame() => frame,
                _ = self.tx.closed() => {
                    debug!(label = self.label, "Sink closed, stopping pump");
                    return Err(PumpError::SinkClosed);
                }
            };

            match next {
                None => {
                    self.completed.store(true, Ordering::Release);
                    debug!(
                        label = self.label,
                        frames = summary.frames,
                        bytes = summary.bytes,
                        pauses = summary.pauses,
                        "Source reached end of stream"
                    );
                    return Ok(summary);
                }
                Some(Ok(frame)) => {
                    summary.frames += 1;
                    if let Some(data) = frame.data_ref() {
                        summary.bytes += data.len() as u64;
                    }
                    match self.tx.try_send(Ok(frame)) {
                        Ok(()) => {}
                        Err(TrySendError::Full(item)) => {
                            summary.pauses += 1;
                            trace!(label = self.label, "Sink saturated, pausing source");
                            if self.tx.send(item).await.is_err() {
                                return Err(PumpError::SinkClosed);
                            }
                        }
                        Err(TrySendError::Closed(_)) => return Err(PumpError::SinkClosed),
                    }
                }
                Some(Err(e)) => {
                    let err: BoxError = e.into();
                    let message = err.to_string();
                    debug!(label = self.label, error = %message, "Source stream failed");
                    if self.error_notice && self.framing.is_chunked() {
                        let notice = Bytes::from(format!("error: {}", message));
                        let _ = self.tx.send(Ok(Frame::data(notice))).await;
                    }
                    let _ = self.tx.send(Err(err)).await;
                    return Err(PumpError::Source(message));
                }
            }
        }
    }
}

/// Handle to a running pump
#[derive(Debug)]
pub struct PumpHandle {
    task: JoinHandle<Result<PumpSummary, PumpError>>,
}

impl PumpHandle {
    /// Tear the pump down; its sink then reports an error instead of a clean end
    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn finished(self) -> Result<PumpSummary, PumpError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(PumpError::Cancelled),
            Err(e) => Err(PumpError::Source(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{Full, StreamBody};
    use hyper::header::HeaderValue;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Source that counts how many frames have been pulled from it
    struct CountingBody {
        chunks: VecDeque<Bytes>,
        pulled: Arc<AtomicUsize>,
    }

    impl CountingBody {
        fn new(chunks: Vec<Bytes>) -> (Self, Arc<AtomicUsize>) {
            let pulled = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    chunks: chunks.into(),
                    pulled: Arc::clone(&pulled),
                },
                pulled,
            )
        }
    }

    impl Body for CountingBody {
        type Data = Bytes;
        type Error = std::io::Error;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, std::io::Error>>> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    self.pulled.fetch_add(1, Ordering::SeqCst);
                    Poll::Ready(Some(Ok(Frame::data(chunk))))
                }
                None => Poll::Ready(None),
            }
        }
    }

    fn chunks(count: usize, size: usize) -> Vec<Bytes> {
        (0..count)
            .map(|i| Bytes::from(vec![(i % 251) as u8; size]))
            .collect()
    }

    #[tokio::test]
    async fn test_pauses_source_when_sink_saturated() {
        let input = chunks(64, 1024);
        let expected: Vec<u8> = input.iter().flat_map(|c| c.to_vec()).collect();
        let (source, pulled) = CountingBody::new(input);

        let (pump, sink) = couple(source, Framing::Chunked, 2);
        let handle = pump.start();

        // Nobody reads the sink yet: the pump must stop after filling the channel
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(pulled.load(Ordering::SeqCst) <= 3, "pulled {}", pulled.load(Ordering::SeqCst));
        assert!(!handle.is_finished());

        let collected = sink.collect().await.unwrap().to_bytes();
        assert_eq!(collected.as_ref(), expected.as_slice());

        let summary = handle.finished().await.unwrap();
        assert_eq!(summary.frames, 64);
        assert_eq!(summary.bytes, 64 * 1024);
        assert!(summary.pauses >= 1);
        assert_eq!(pulled.load(Ordering::SeqCst), 64);
    }

    #[tokio::test]
    async fn test_empty_source_ends_sink() {
        let (pump, sink) = couple(Full::new(Bytes::new()), Framing::Length(0), 4);
        let handle = pump.start();

        let collected = sink.collect().await.unwrap().to_bytes();
        assert!(collected.is_empty());
        assert!(handle.finished().await.is_ok());
    }

    #[tokio::test]
    async fn test_source_error_fails_sink() {
        let frames: Vec<Result<Frame<Bytes>, std::io::Error>> = vec![
            Ok(Frame::data(Bytes::from_static(b"partial"))),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "backend reset")),
        ];
        let source = StreamBody::new(futures::stream::iter(frames));

        let (pump, sink) = couple(source, Framing::Chunked, 4);
        let handle = pump.start();

        assert!(sink.collect().await.is_err());
        assert_eq!(
            handle.finished().await,
            Err(PumpError::Source("backend reset".to_string()))
        );
    }

    #[tokio::test]
    async fn test_error_notice_is_written_before_failure() {
        let frames: Vec<Result<Frame<Bytes>, std::io::Error>> = vec![Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "eof",
        ))];
        let source = StreamBody::new(futures::stream::iter(frames));

        let (pump, mut sink) = couple(source, Framing::Chunked, 4);
        let _handle = pump.relay_error_notice().start();

        let first = sink.frame().await.unwrap().unwrap().into_data().unwrap();
        assert_eq!(first, Bytes::from_static(b"error: eof"));
        assert!(sink.frame().await.unwrap().is_err());
        assert!(sink.frame().await.is_none());
    }

    #[tokio::test]
    async fn test_error_notice_skipped_for_length_framing() {
        let frames: Vec<Result<Frame<Bytes>, std::io::Error>> = vec![
            Ok(Frame::data(Bytes::from_static(b"partial"))),
            Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof")),
        ];
        let source = StreamBody::new(futures::stream::iter(frames));

        let (pump, mut sink) = couple(source, Framing::Length(10), 4);
        let handle = pump.relay_error_notice().start();

        let first = sink.frame().await.unwrap().unwrap().into_data().unwrap();
        assert_eq!(first, Bytes::from_static(b"partial"));
        assert!(sink.frame().await.unwrap().is_err());
        assert!(sink.frame().await.is_none());
        assert_eq!(handle.finished().await, Err(PumpError::Source("eof".to_string())));
    }

    #[tokio::test]
    async fn test_dropped_sink_stops_pump() {
        let (source, _pulled) = CountingBody::new(chunks(64, 16));
        let (pump, sink) = couple(source, Framing::Chunked, 1);
        let handle = pump.start();

        drop(sink);
        assert_eq!(handle.finished().await, Err(PumpError::SinkClosed));
    }

    #[tokio::test]
    async fn test_abort_surfaces_error_in_sink() {
        let pending = StreamBody::new(Box::pin(
            futures::stream::pending::<Result<Frame<Bytes>, std::io::Error>>(),
        ));
        let (pump, sink) = couple(pending, Framing::Chunked, 1);
        let handle = pump.start();

        handle.abort();
        assert!(sink.collect().await.is_err());
    }

    #[test]
    fn test_framing_from_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(Framing::from_headers(&headers), Framing::Chunked);

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("42"));
        assert_eq!(Framing::from_headers(&headers), Framing::Length(42));

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("nope"));
        assert!(Framing::from_headers(&headers).is_chunked());
    }

    #[test]
    fn test_sink_size_hint_follows_framing() {
        let (_pump, sink) = couple(Full::new(Bytes::new()), Framing::Length(10), 1);
        assert_eq!(sink.size_hint().exact(), Some(10));

        let (_pump, sink) = couple(Full::new(Bytes::new()), Framing::Chunked, 1);
        assert_eq!(sink.size_hint().exact(), None);
    }
}
