//! Response side of the protocol engine.
//!
//! # Responsibilities
//! - Hold status, reason and headers until the first body byte is written
//! - Stream body frames to hyper through a bounded channel (backpressure)
//! - Emit the pending config blob ahead of any other body byte, once
//! - Attach trailers at close, or abort the stream on `destroy`
//!
//! # Design Decisions
//! - "Committed" means the head has been handed to hyper; after that the
//!   status can no longer change
//! - `destroy` pushes an error frame, which makes hyper drop the connection
//!   without a terminating chunk

use std::io;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Response, StatusCode};
use bytes::Bytes;
use http_body_util::StreamBody;
use hyper::body::Frame;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

type FrameResult = Result<Frame<Bytes>, io::Error>;

/// Everything hyper needs to send the response head.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub reason: Option<String>,
    pub headers: HeaderMap,
}

/// Where the response is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    Open,
    Closed,
    Destroyed,
}

/// Writable side of a streamed response.
pub struct ProtocolResponse {
    status: StatusCode,
    reason: Option<String>,
    headers: HeaderMap,
    trailers: HeaderMap,
    prefix: Option<Bytes>,
    head_tx: Option<oneshot::Sender<ResponseHead>>,
    body_tx: Option<mpsc::Sender<FrameResult>>,
    state: ResponseState,
    bytes_written: u64,
}

/// Readable side, turned into an HTTP response by the server glue.
pub struct ResponseHandle {
    head_rx: oneshot::Receiver<ResponseHead>,
    body_rx: mpsc::Receiver<FrameResult>,
}

impl ProtocolResponse {
    /// Create a response whose body channel holds at most `capacity` frames.
    pub fn channel(capacity: usize) -> (Self, ResponseHandle) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(capacity.max(1));
        let response = Self {
            status: StatusCode::OK,
            reason: None,
            headers: HeaderMap::new(),
            trailers: HeaderMap::new(),
            prefix: None,
            head_tx: Some(head_tx),
            body_tx: Some(body_tx),
            state: ResponseState::Open,
            bytes_written: 0,
        };
        (response, ResponseHandle { head_rx, body_rx })
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        if self.is_committed() {
            tracing::warn!(%status, "Ignoring status change on committed response");
            return;
        }
        self.status = status;
    }

    /// Custom reason phrase sent with the status line.
    pub fn set_reason(&mut self, reason: &str) {
        self.reason = Some(sanitize_reason(reason));
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Set a header from a string; invalid values are dropped with a warning.
    pub fn set_header(&mut self, name: HeaderName, value: &str) {
        match HeaderValue::from_str(value) {
            Ok(value) => {
                self.headers.insert(name, value);
            }
            Err(_) => tracing::warn!(header = %name, "Dropping invalid header value"),
        }
    }

    /// Trailer fields sent after the last body chunk.
    pub fn trailers_mut(&mut self) -> &mut HeaderMap {
        &mut self.trailers
    }

    /// Install bytes that must precede every other body byte.
    pub fn set_prefix(&mut self, prefix: Bytes) {
        if self.is_committed() {
            tracing::warn!("Prefix installed after commit; dropping it");
            return;
        }
        self.prefix = Some(prefix);
    }

    /// Whether the head has been released.
    pub fn is_committed(&self) -> bool {
        self.head_tx.is_none()
    }

    pub fn state(&self) -> ResponseState {
        self.state
    }

    /// Content bytes written so far, prefix excluded.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn ensure_open(&self) -> io::Result<()> {
        match self.state {
            ResponseState::Open => Ok(()),
            ResponseState::Closed => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "response already closed",
            )),
            ResponseState::Destroyed => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "response destroyed",
            )),
        }
    }

    async fn send_frame(&mut self, frame: Frame<Bytes>) -> io::Result<()> {
        let tx = self
            .body_tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "body stream closed"))?;
        tx.send(Ok(frame))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client went away"))
    }

    /// Release the head, then the prefix.
    pub async fn commit(&mut self) -> io::Result<()> {
        let Some(head_tx) = self.head_tx.take() else {
            return Ok(());
        };
        let head = ResponseHead {
            status: self.status,
            reason: self.reason.clone(),
            headers: std::mem::take(&mut self.headers),
        };
        head_tx
            .send(head)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client went away"))?;
        if let Some(prefix) = self.prefix.take() {
            self.send_frame(Frame::data(prefix)).await?;
        }
        Ok(())
    }

    /// Write body bytes, committing the head first if needed.
    pub async fn write(&mut self, data: Bytes) -> io::Result<()> {
        self.ensure_open()?;
        self.commit().await?;
        if data.is_empty() {
            return Ok(());
        }
        let len = data.len() as u64;
        self.send_frame(Frame::data(data)).await?;
        self.bytes_written += len;
        Ok(())
    }

    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.write(Bytes::copy_from_slice(data)).await
    }

    /// Finish the body, sending trailers if any were set.
    pub async fn close(&mut self) -> io::Result<()> {
        self.ensure_open()?;
        let result = self.finish().await;
        self.body_tx = None;
        self.state = ResponseState::Closed;
        result
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.commit().await?;
        if !self.trailers.is_empty() {
            let trailers = std::mem::take(&mut self.trailers);
            self.send_frame(Frame::trailers(trailers)).await?;
        }
        Ok(())
    }

    /// Abort the stream; the client sees the connection drop mid-body.
    pub async fn destroy(&mut self) {
        if self.state == ResponseState::Destroyed {
            return;
        }
        self.head_tx = None;
        if let Some(tx) = self.body_tx.take() {
            let _ = tx
                .send(Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "response destroyed",
                )))
                .await;
        }
        self.state = ResponseState::Destroyed;
    }
}

impl ResponseHandle {
    /// Wait for the head and wrap the body channel for hyper.
    pub async fn into_http(self) -> Response<Body> {
        let head = match self.head_rx.await {
            Ok(head) => head,
            Err(_) => {
                tracing::error!("Request task ended without committing a response");
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                return response;
            }
        };

        let body = Body::new(StreamBody::new(ReceiverStream::new(self.body_rx)));
        let mut response = Response::new(body);
        *response.status_mut() = head.status;
        *response.headers_mut() = head.headers;
        if let Some(reason) = head.reason {
            if let Ok(phrase) = hyper::ext::ReasonPhrase::try_from(reason.into_bytes()) {
                response.extensions_mut().insert(phrase);
            }
        }
        response
    }

    /// Drain the whole response in memory.
    pub async fn collect(self) -> CollectedResponse {
        let mut collected = CollectedResponse::default();
        if let Ok(head) = self.head_rx.await {
            collected.status = Some(head.status);
            collected.reason = head.reason;
            collected.headers = head.headers;
        }
        let mut body_rx = self.body_rx;
        while let Some(frame) = body_rx.recv().await {
            match frame {
                Ok(frame) => match frame.into_data() {
                    Ok(data) => collected.body.extend_from_slice(&data),
                    Err(frame) => {
                        if let Ok(trailers) = frame.into_trailers() {
                            collected.trailers = Some(trailers);
                        }
                    }
                },
                Err(_) => {
                    collected.aborted = true;
                    break;
                }
            }
        }
        collected
    }
}

/// A fully drained response.
#[derive(Debug, Default)]
pub struct CollectedResponse {
    pub status: Option<StatusCode>,
    pub reason: Option<String>,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub trailers: Option<HeaderMap>,
    /// The stream ended with an abort instead of a clean close.
    pub aborted: bool,
}

impl CollectedResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn trailer(&self, name: &str) -> Option<&str> {
        self.trailers
            .as_ref()
            .and_then(|t| t.get(name))
            .and_then(|v| v.to_str().ok())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Strip characters that cannot appear in a status line or header value.
pub fn sanitize_reason(reason: &str) -> String {
    reason
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { ' ' })
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn head_is_held_until_first_write() {
        let (mut response, handle) = ProtocolResponse::channel(8);
        response.set_status(StatusCode::CREATED);
        assert!(!response.is_committed());
        let producer = async move {
            response.write_all(b"abc").await.unwrap();
            assert!(response.is_committed());
            response.set_status(StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(response.status(), StatusCode::CREATED);
            response.close().await.unwrap();
        };
        let (_, collected) = tokio::join!(producer, handle.collect());
        assert_eq!(collected.status, Some(StatusCode::CREATED));
        assert_eq!(collected.body, b"abc");
        assert!(!collected.aborted);
    }

    #[tokio::test]
    async fn prefix_precedes_body_exactly_once() {
        let (mut response, handle) = ProtocolResponse::channel(8);
        response.set_prefix(Bytes::from_static(b"CFG|"));
        let producer = async move {
            response.write_all(b"one").await.unwrap();
            response.write_all(b"two").await.unwrap();
            response.close().await.unwrap();
            response.bytes_written()
        };
        let (written, collected) = tokio::join!(producer, handle.collect());
        assert_eq!(collected.body, b"CFG|onetwo");
        assert_eq!(written, 6);
    }

    #[tokio::test]
    async fn prefix_sent_on_empty_close() {
        let (mut response, handle) = ProtocolResponse::channel(8);
        response.set_prefix(Bytes::from_static(b"CFG"));
        let producer = async move { response.close().await.unwrap() };
        let (_, collected) = tokio::join!(producer, handle.collect());
        assert_eq!(collected.body, b"CFG");
    }

    #[tokio::test]
    async fn trailers_follow_body() {
        let (mut response, handle) = ProtocolResponse::channel(8);
        let producer = async move {
            response.write_all(b"data").await.unwrap();
            response
                .trailers_mut()
                .insert("x-error-status", HeaderValue::from_static("500"));
            response.close().await.unwrap();
        };
        let (_, collected) = tokio::join!(producer, handle.collect());
        assert_eq!(collected.body, b"data");
        assert_eq!(collected.trailer("x-error-status"), Some("500"));
    }

    #[tokio::test]
    async fn destroy_aborts_and_blocks_further_use() {
        let (mut response, handle) = ProtocolResponse::channel(8);
        let producer = async move {
            response.write_all(b"partial").await.unwrap();
            response.destroy().await;
            assert_eq!(response.state(), ResponseState::Destroyed);
            assert!(response.write_all(b"more").await.is_err());
            assert!(response.close().await.is_err());
        };
        let (_, collected) = tokio::join!(producer, handle.collect());
        assert!(collected.aborted);
        assert_eq!(collected.body, b"partial");
    }

    #[tokio::test]
    async fn writes_fail_once_reader_is_gone() {
        let (mut response, handle) = ProtocolResponse::channel(1);
        drop(handle);
        let err = response.write_all(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn reasons_are_single_line() {
        assert_eq!(sanitize_reason("bad\r\nthing\t"), "bad  thing");
    }
}
