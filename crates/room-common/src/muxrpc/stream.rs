use super::endpoint::Endpoint;
use super::{CallError, StreamError};
use crate::frame::{BodyType, Packet};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One packet body received on a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Body {
    /// Encoding flag the peer set.
    pub body_type: BodyType,
    /// Raw bytes.
    pub data: Vec<u8>,
}

impl Body {
    /// Decode the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Json`] when the bytes do not decode as `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, StreamError> {
        serde_json::from_slice(&self.data).map_err(|e| StreamError::Json(e.to_string()))
    }
}

pub(crate) enum SourceEvent {
    Data(Body),
    End,
    Error(StreamError),
}

/// Reading half of a stream.
///
/// `next` resolves when a packet arrives, when the peer ends its direction
/// or when the stream is cancelled. The session never waits on a slow
/// reader: a stream whose buffer fills up fails with
/// [`StreamError::Overflow`] while its siblings keep flowing.
pub struct ByteSource {
    rx: mpsc::Receiver<SourceEvent>,
    cancel: CancellationToken,
    done: bool,
}

impl ByteSource {
    pub(crate) fn new(rx: mpsc::Receiver<SourceEvent>, cancel: CancellationToken) -> Self {
        Self {
            rx,
            cancel,
            done: false,
        }
    }

    /// Wait for the next body. `Ok(None)` is a clean end of stream.
    ///
    /// # Errors
    ///
    /// [`StreamError::Remote`] if the peer ended with an error,
    /// [`StreamError::Cancelled`] if the stream context fired and
    /// [`StreamError::SessionEnded`] if the session went away first.
    pub async fn next(&mut self) -> Result<Option<Body>, StreamError> {
        if self.done {
            return Ok(None);
        }
        tokio::select! {
            biased;
            event = self.rx.recv() => match event {
                Some(SourceEvent::Data(body)) => Ok(Some(body)),
                Some(SourceEvent::End) => {
                    self.done = true;
                    Ok(None)
                }
                Some(SourceEvent::Error(err)) => {
                    self.done = true;
                    Err(err)
                }
                None => {
                    self.done = true;
                    Err(StreamError::SessionEnded)
                }
            },
            () = self.cancel.cancelled() => Err(StreamError::Cancelled),
        }
    }

    /// Wait for the next body and decode it as JSON.
    ///
    /// # Errors
    ///
    /// Same as [`ByteSource::next`], plus [`StreamError::Json`].
    pub async fn next_json<T: DeserializeOwned>(&mut self) -> Result<Option<T>, StreamError> {
        match self.next().await? {
            Some(body) => body.json().map(Some),
            None => Ok(None),
        }
    }
}

/// Shared "this direction is finished" flag.
#[derive(Debug, Default)]
pub(crate) struct SinkState {
    closed: AtomicBool,
}

impl SinkState {
    pub(crate) fn closed() -> Arc<Self> {
        Arc::new(Self {
            closed: AtomicBool::new(true),
        })
    }

    /// Mark closed; true if this call did the closing.
    pub(crate) fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Writing half of a stream.
///
/// Dropping an open sink obtained from an outbound call ends the stream
/// cleanly. Sinks handed to handlers are ended by the session once the
/// handler returns.
pub struct ByteSink {
    key: i32,
    body_type: BodyType,
    state: Arc<SinkState>,
    endpoint: Endpoint,
    cancel: CancellationToken,
    end_on_drop: bool,
}

impl ByteSink {
    pub(crate) fn new(
        key: i32,
        state: Arc<SinkState>,
        endpoint: Endpoint,
        cancel: CancellationToken,
        end_on_drop: bool,
    ) -> Self {
        Self {
            key,
            body_type: BodyType::Binary,
            state,
            endpoint,
            cancel,
            end_on_drop,
        }
    }

    /// Encoding flag used by [`ByteSink::write`].
    pub fn set_body_type(&mut self, body_type: BodyType) {
        self.body_type = body_type;
    }

    /// True once this side has ended the stream.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Send one packet. Waits while the session's send queue is full.
    ///
    /// # Errors
    ///
    /// Fails when the stream was closed or cancelled or the session ended.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), StreamError> {
        self.write_typed(self.body_type, data.to_vec()).await
    }

    /// Serialize `value` and send it as one JSON packet.
    ///
    /// # Errors
    ///
    /// Same as [`ByteSink::write`].
    pub async fn write_json<T: Serialize>(&mut self, value: &T) -> Result<(), StreamError> {
        let data = serde_json::to_vec(value).map_err(|e| StreamError::Json(e.to_string()))?;
        self.write_typed(BodyType::Json, data).await
    }

    async fn write_typed(&mut self, body_type: BodyType, data: Vec<u8>) -> Result<(), StreamError> {
        if self.state.is_closed() {
            return Err(StreamError::Closed);
        }
        let pkt = Packet {
            stream: true,
            end_or_error: false,
            body_type,
            req: self.key,
            body: data,
        };
        self.endpoint.send_packet(pkt, &self.cancel).await
    }

    /// End this direction cleanly.
    ///
    /// # Errors
    ///
    /// Fails only if the session is gone.
    pub async fn close(self) -> Result<(), StreamError> {
        self.closer().close().await
    }

    /// End this direction with an error the peer will see.
    ///
    /// # Errors
    ///
    /// Fails only if the session is gone.
    pub async fn close_with_error(self, err: &CallError) -> Result<(), StreamError> {
        self.closer().close_with_error(err).await
    }

    fn closer(&self) -> SinkCloser {
        SinkCloser::new(self.key, Arc::clone(&self.state), self.endpoint.clone())
    }
}

impl Drop for ByteSink {
    fn drop(&mut self) {
        if self.end_on_drop && self.state.close() {
            self.endpoint.end_in_background(Packet::end_of_stream(self.key));
        }
    }
}

/// Ends a sink that may have been moved elsewhere.
pub(crate) struct SinkCloser {
    key: i32,
    state: Arc<SinkState>,
    endpoint: Endpoint,
}

impl SinkCloser {
    pub(crate) fn new(key: i32, state: Arc<SinkState>, endpoint: Endpoint) -> Self {
        Self {
            key,
            state,
            endpoint,
        }
    }

    pub(crate) async fn close(&self) -> Result<(), StreamError> {
        if !self.state.close() {
            return Ok(());
        }
        self.endpoint
            .send_end(Packet::end_of_stream(self.key))
            .await
    }

    pub(crate) async fn close_with_error(&self, err: &CallError) -> Result<(), StreamError> {
        if !self.state.close() {
            return Ok(());
        }
        self.endpoint
            .send_end(Packet::json(self.key, true, true, err.to_json()))
            .await
    }
}
