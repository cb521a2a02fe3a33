use super::mux::{Handler, HandlerMux};
use super::stream::{SinkCloser, SinkState, SourceEvent};
use super::{
    Body, ByteSink, ByteSource, CallError, CallType, ErrorBody, Method, MuxError, Request,
    RequestBody, StreamError,
};
use crate::boxstream::{BoxReader, BoxWriter};
use crate::frame::{BodyType, Header, Packet, HEADER_LEN};
use crate::FeedRef;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Packets queued for the writer before senders wait.
const OUTBOUND_QUEUE: usize = 64;
/// Bodies buffered per inbound stream. A stream that overruns it is failed.
const SOURCE_QUEUE: usize = 256;
/// How long a closing session may spend flushing queued packets.
const CLOSE_FLUSH: Duration = Duration::from_secs(2);

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

enum Slot {
    Call(oneshot::Sender<Result<Body, CallError>>),
    Stream(StreamSlot),
}

struct StreamSlot {
    source: Option<mpsc::Sender<SourceEvent>>,
    sink: Arc<SinkState>,
    cancel: CancellationToken,
    remote_ended: bool,
    /// Answer the peer's end with our own: outbound sources have no sink.
    echo_end: bool,
}

struct Inner {
    id: u64,
    remote: FeedRef,
    started: Instant,
    cancel: CancellationToken,
    outbound: mpsc::Sender<Packet>,
    streams: Mutex<HashMap<i32, Slot>>,
    next_req: AtomicI32,
}

/// Handle to one muxrpc session. Cheap to clone.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.inner.id)
            .field("remote", &self.inner.remote)
            .finish_non_exhaustive()
    }
}

/// Start a muxrpc session over an established boxstream.
///
/// Returns the session handle and the future that drives it. The future
/// resolves once the session ends: the peer said goodbye, the transport
/// failed, or `cancel` fired. Cancelling sends a goodbye before returning.
pub fn start_session<R, W>(
    reader: BoxReader<R>,
    writer: BoxWriter<W>,
    remote: FeedRef,
    mux: Arc<HandlerMux>,
    cancel: CancellationToken,
) -> (Endpoint, impl Future<Output = Result<(), MuxError>> + Send + 'static)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let endpoint = Endpoint {
        inner: Arc::new(Inner {
            id: NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            started: Instant::now(),
            cancel,
            outbound,
            streams: Mutex::new(HashMap::new()),
            next_req: AtomicI32::new(1),
        }),
    };

    let session = endpoint.clone();
    let serve = async move {
        let cancel = session.inner.cancel.clone();
        let read = async {
            let res = session.read_loop(PacketReader::new(reader), &mux).await;
            cancel.cancel();
            res
        };
        let write = async {
            let res = write_loop(writer, outbound_rx, cancel.clone()).await;
            cancel.cancel();
            res
        };
        let (read_res, write_res) = tokio::join!(read, write);
        session.fail_all();
        debug!(
            remote = %session.inner.remote.short(),
            elapsed = ?session.inner.started.elapsed(),
            "muxrpc session ended"
        );
        read_res.and(write_res)
    };
    (endpoint, serve)
}

impl Endpoint {
    /// Identity proven by the handshake.
    #[must_use]
    pub fn remote(&self) -> &FeedRef {
        &self.inner.remote
    }

    /// Process-unique session number.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// When the session started.
    #[must_use]
    pub fn started(&self) -> Instant {
        self.inner.started
    }

    /// Session cancellation token.
    #[must_use]
    pub fn context(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// True once the session is shutting down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Ask the session to end.
    pub fn terminate(&self) {
        self.inner.cancel.cancel();
    }

    /// Number of streams and pending calls currently tracked.
    #[must_use]
    pub fn open_streams(&self) -> usize {
        self.streams().len()
    }

    /// Call an async method on the peer and wait for its reply.
    ///
    /// # Errors
    ///
    /// Returns the peer's error as [`CallError::Remote`] or
    /// [`CallError::Unavailable`] when the session ends first.
    pub async fn call_async(&self, method: Method, args: Value) -> Result<Body, CallError> {
        let req = self.allocate();
        let (tx, rx) = oneshot::channel();
        self.streams().insert(req, Slot::Call(tx));
        self.send_request(req, method, args, CallType::Async).await?;
        rx.await
            .map_err(|_| CallError::Unavailable("session ended".to_string()))?
    }

    /// Open a source stream on the peer.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Unavailable`] if the session is gone.
    pub async fn source(&self, method: Method, args: Value) -> Result<ByteSource, CallError> {
        let (source, _sink) = self.open_stream(method, args, CallType::Source).await?;
        Ok(source)
    }

    /// Open a duplex stream on the peer.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Unavailable`] if the session is gone.
    pub async fn duplex(
        &self,
        method: Method,
        args: Value,
    ) -> Result<(ByteSource, ByteSink), CallError> {
        let (source, sink) = self.open_stream(method, args, CallType::Duplex).await?;
        let sink = sink.ok_or_else(|| CallError::Failed("duplex without sink".to_string()))?;
        Ok((source, sink))
    }

    async fn open_stream(
        &self,
        method: Method,
        args: Value,
        call_type: CallType,
    ) -> Result<(ByteSource, Option<ByteSink>), CallError> {
        let req = self.allocate();
        let cancel = self.inner.cancel.child_token();
        let (tx, rx) = source_channel();
        let state = Arc::new(SinkState::default());
        self.streams().insert(
            req,
            Slot::Stream(StreamSlot {
                source: Some(tx),
                sink: Arc::clone(&state),
                cancel: cancel.clone(),
                remote_ended: false,
                echo_end: call_type == CallType::Source,
            }),
        );
        self.send_request(req, method, args, call_type).await?;
        let sink = (call_type == CallType::Duplex)
            .then(|| ByteSink::new(req, state, self.clone(), cancel.clone(), true));
        Ok((ByteSource::new(rx, cancel), sink))
    }

    async fn send_request(
        &self,
        req: i32,
        method: Method,
        args: Value,
        call_type: CallType,
    ) -> Result<(), CallError> {
        let args = match args {
            Value::Array(_) => args,
            Value::Null => Value::Array(Vec::new()),
            other => Value::Array(vec![other]),
        };
        let body = RequestBody {
            name: method,
            args,
            call_type: Some(call_type),
        };
        let data = serde_json::to_vec(&body).map_err(|e| CallError::Invalid(e.to_string()))?;
        let pkt = Packet::json(req, call_type.is_stream(), false, data);
        if let Err(err) = self.send_packet(pkt, &self.inner.cancel).await {
            self.streams().remove(&req);
            return Err(CallError::from(err));
        }
        Ok(())
    }

    fn allocate(&self) -> i32 {
        let req = self.inner.next_req.fetch_add(1, Ordering::Relaxed);
        if req <= 0 {
            self.inner.next_req.store(2, Ordering::Relaxed);
            return 1;
        }
        req
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<i32, Slot>> {
        self.inner
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) async fn send_packet(
        &self,
        pkt: Packet,
        cancel: &CancellationToken,
    ) -> Result<(), StreamError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(StreamError::Cancelled),
            res = self.inner.outbound.send(pkt) => res.map_err(|_| StreamError::SessionEnded),
        }
    }

    /// Queue the terminating packet of a local direction.
    pub(crate) async fn send_end(&self, pkt: Packet) -> Result<(), StreamError> {
        let key = pkt.req;
        let res = self.send_packet(pkt, &self.inner.cancel).await;
        self.local_end(key);
        res
    }

    /// Like [`Endpoint::send_end`] but usable from `Drop`.
    pub(crate) fn end_in_background(&self, pkt: Packet) {
        let key = pkt.req;
        match self.inner.outbound.try_send(pkt) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(pkt)) => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let endpoint = self.clone();
                    handle.spawn(async move {
                        let _ = endpoint.send_packet(pkt, &endpoint.inner.cancel).await;
                    });
                }
            }
        }
        self.local_end(key);
    }

    fn local_end(&self, key: i32) {
        let mut streams = self.streams();
        let finished = matches!(streams.get(&key), Some(Slot::Stream(slot)) if slot.remote_ended);
        if finished {
            if let Some(Slot::Stream(slot)) = streams.remove(&key) {
                slot.cancel.cancel();
            }
        }
    }

    async fn read_loop<R>(
        &self,
        mut reader: PacketReader<R>,
        mux: &Arc<HandlerMux>,
    ) -> Result<(), MuxError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let pkt = tokio::select! {
                biased;
                () = self.inner.cancel.cancelled() => return Ok(()),
                pkt = reader.read_packet() => pkt?,
            };
            let Some(pkt) = pkt else {
                debug!(remote = %self.inner.remote.short(), "peer said goodbye");
                return Ok(());
            };
            self.handle_packet(pkt, mux).await;
        }
    }

    async fn handle_packet(&self, pkt: Packet, mux: &Arc<HandlerMux>) {
        let key = pkt.req.wrapping_neg();
        enum Action {
            Reply(oneshot::Sender<Result<Body, CallError>>),
            Deliver(mpsc::Sender<SourceEvent>),
            End,
            Ignore,
            New,
        }

        let route = {
            let mut streams = self.streams();
            let is_call = matches!(streams.get(&key), Some(Slot::Call(_)));
            if is_call {
                match streams.remove(&key) {
                    Some(Slot::Call(tx)) => Action::Reply(tx),
                    _ => Action::Ignore,
                }
            } else {
                match streams.get(&key) {
                    Some(Slot::Stream(_)) if pkt.end_or_error => Action::End,
                    Some(Slot::Stream(StreamSlot {
                        source: Some(tx), ..
                    })) => Action::Deliver(tx.clone()),
                    Some(_) => Action::Ignore,
                    None if pkt.req > 0 && !pkt.end_or_error => Action::New,
                    None => Action::Ignore,
                }
            }
        };

        match route {
            Action::Reply(tx) => {
                let body = Body {
                    body_type: pkt.body_type,
                    data: pkt.body,
                };
                let res = if pkt.end_or_error && is_error_body(&body.data) {
                    Err(CallError::from_wire(&body.data))
                } else {
                    Ok(body)
                };
                let _ = tx.send(res);
            }
            Action::Deliver(tx) => {
                // The last slot is kept for the terminating event.
                if tx.capacity() <= 1 {
                    self.overflow(key);
                    return;
                }
                let event = SourceEvent::Data(Body {
                    body_type: pkt.body_type,
                    data: pkt.body,
                });
                if tx.try_send(event).is_err() {
                    if let Some(Slot::Stream(slot)) = self.streams().get_mut(&key) {
                        slot.source = None;
                    }
                }
            }
            Action::End => self.remote_end(key, &pkt).await,
            Action::New => self.dispatch(pkt, mux),
            Action::Ignore => {
                trace!(req = pkt.req, "dropping packet for unknown stream");
            }
        }
    }

    async fn remote_end(&self, key: i32, pkt: &Packet) {
        let event = if is_clean_end(pkt) {
            SourceEvent::End
        } else {
            SourceEvent::Error(StreamError::Remote(
                CallError::from_wire(&pkt.body).to_body().message,
            ))
        };

        // Take what we need out of the slot, then act without the lock.
        let taken = {
            let mut streams = self.streams();
            match streams.get_mut(&key) {
                Some(Slot::Stream(slot)) => {
                    slot.remote_ended = true;
                    let source = slot.source.take();
                    let answer = !slot.sink.is_closed() && (source.is_none() || slot.echo_end);
                    let finished = answer || slot.sink.is_closed();
                    Some((source, answer, finished))
                }
                _ => None,
            }
        };
        let Some((source, answer, finished)) = taken else {
            return;
        };

        if let Some(tx) = source {
            let _ = tx.try_send(event);
        }
        if !finished {
            return;
        }
        let slot = self.streams().remove(&key);
        if let Some(Slot::Stream(slot)) = slot {
            slot.cancel.cancel();
            if answer && slot.sink.close() {
                let _ = self
                    .send_packet(Packet::end_of_stream(key), &self.inner.cancel)
                    .await;
            }
        }
    }

    /// Fail one stream whose reader stopped keeping up. Later packets for
    /// it are dropped until the peer ends its direction.
    fn overflow(&self, key: i32) {
        let taken = {
            let mut streams = self.streams();
            match streams.get_mut(&key) {
                Some(Slot::Stream(slot)) => {
                    slot.cancel.cancel();
                    Some((slot.source.take(), slot.sink.close()))
                }
                _ => None,
            }
        };
        let Some((source, answer)) = taken else {
            return;
        };
        debug!(remote = %self.inner.remote.short(), req = key, "stream buffer overflow");
        if let Some(tx) = source {
            let _ = tx.try_send(SourceEvent::Error(StreamError::Overflow));
        }
        if answer {
            let err = CallError::Failed(StreamError::Overflow.to_string());
            self.reply_error(key, true, err);
        }
    }

    fn dispatch(&self, pkt: Packet, mux: &Arc<HandlerMux>) {
        let key = pkt.req.wrapping_neg();
        let body: RequestBody = match serde_json::from_slice(&pkt.body) {
            Ok(body) => body,
            Err(e) => {
                debug!(req = pkt.req, "undecodable request: {}", e);
                let err = CallError::Invalid(format!("bad request: {e}"));
                self.reply_error(key, pkt.stream, err);
                return;
            }
        };
        let call_type = body.call_type.unwrap_or(if pkt.stream {
            CallType::Source
        } else {
            CallType::Async
        });

        let route = match mux.route(&body.name) {
            None => {
                debug!(method = %body.name, "no handler registered");
                self.reply_error(key, call_type.is_stream(), CallError::MethodNotFound);
                return;
            }
            Some(route) if route.handler.call_type() != call_type => {
                self.reply_error(key, call_type.is_stream(), CallError::WrongCallType);
                return;
            }
            Some(route) => route.clone(),
        };

        let ctx = self.inner.cancel.child_token();
        let request = Request {
            method: body.name,
            call_type,
            args: body.args,
            endpoint: self.clone(),
            ctx: ctx.clone(),
        };

        let mut source = None;
        let mut sink = None;
        let mut closer = None;
        if call_type.is_stream() {
            let state = Arc::new(SinkState::default());
            let tx = if matches!(call_type, CallType::Sink | CallType::Duplex) {
                let (tx, rx) = source_channel();
                source = Some(ByteSource::new(rx, ctx.clone()));
                Some(tx)
            } else {
                None
            };
            self.streams().insert(
                key,
                Slot::Stream(StreamSlot {
                    source: tx,
                    sink: Arc::clone(&state),
                    cancel: ctx.clone(),
                    remote_ended: false,
                    echo_end: false,
                }),
            );
            closer = Some(SinkCloser::new(key, Arc::clone(&state), self.clone()));
            if call_type != CallType::Sink {
                sink = Some(ByteSink::new(key, state, self.clone(), ctx, false));
            }
        }

        let endpoint = self.clone();
        tokio::spawn(async move {
            if let Some(authorizer) = &route.authorizer {
                if let Err(err) = authorizer.authorize(&request).await {
                    debug!(method = %request.method, remote = %request.remote().short(), "call refused: {}", err);
                    match closer {
                        Some(closer) => {
                            let _ = closer.close_with_error(&err).await;
                        }
                        None => endpoint.reply_async(key, Err(err)).await,
                    }
                    return;
                }
            }

            let result = match (&route.handler, source, sink) {
                (Handler::Async(h), _, _) => {
                    let res = h.handle_async(&request).await;
                    endpoint.reply_async(key, res).await;
                    return;
                }
                (Handler::Source(h), _, Some(sink)) => h.handle_source(&request, sink).await,
                (Handler::Sink(h), Some(source), _) => h.handle_sink(&request, source).await,
                (Handler::Duplex(h), Some(source), Some(sink)) => {
                    h.handle_duplex(&request, source, sink).await
                }
                _ => Err(CallError::WrongCallType),
            };

            let Some(closer) = closer else { return };
            match result {
                Ok(()) => {
                    let _ = closer.close().await;
                }
                Err(err) => {
                    debug!(method = %request.method, remote = %request.remote().short(), "handler failed: {}", err);
                    let _ = closer.close_with_error(&err).await;
                }
            }
        });
    }

    async fn reply_async(&self, key: i32, res: Result<Value, CallError>) {
        let pkt = match res {
            Ok(value) => Packet::json(
                key,
                false,
                false,
                serde_json::to_vec(&value).unwrap_or_else(|_| b"null".to_vec()),
            ),
            Err(err) => Packet::json(key, false, true, err.to_json()),
        };
        let _ = self.send_packet(pkt, &self.inner.cancel).await;
    }

    fn reply_error(&self, key: i32, stream: bool, err: CallError) {
        let pkt = Packet::json(key, stream, true, err.to_json());
        let endpoint = self.clone();
        tokio::spawn(async move {
            let _ = endpoint.send_packet(pkt, &endpoint.inner.cancel).await;
        });
    }

    fn fail_all(&self) {
        let slots: Vec<Slot> = self.streams().drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            match slot {
                Slot::Call(tx) => {
                    let _ = tx.send(Err(CallError::Unavailable("session ended".to_string())));
                }
                Slot::Stream(slot) => {
                    slot.sink.close();
                    slot.cancel.cancel();
                }
            }
        }
    }
}

fn source_channel() -> (mpsc::Sender<SourceEvent>, mpsc::Receiver<SourceEvent>) {
    mpsc::channel(SOURCE_QUEUE + 1)
}

/// Async replies may carry the end flag on success too; only an error
/// object makes them a failure.
fn is_error_body(data: &[u8]) -> bool {
    serde_json::from_slice::<ErrorBody>(data).is_ok()
}

fn is_clean_end(pkt: &Packet) -> bool {
    pkt.body_type == BodyType::Json
        && serde_json::from_slice::<Value>(&pkt.body).ok() == Some(Value::Bool(true))
}

/// Reassembles packets from boxstream messages.
struct PacketReader<R> {
    boxes: BoxReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    fn new(boxes: BoxReader<R>) -> Self {
        Self {
            boxes,
            buf: Vec::new(),
        }
    }

    /// Buffer at least `n` bytes. False if the stream ended first.
    async fn fill(&mut self, n: usize) -> Result<bool, MuxError> {
        while self.buf.len() < n {
            match self.boxes.read_message().await? {
                Some(chunk) => self.buf.extend_from_slice(&chunk),
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    async fn read_packet(&mut self) -> Result<Option<Packet>, MuxError> {
        if !self.fill(HEADER_LEN).await? {
            if self.buf.is_empty() {
                return Ok(None);
            }
            return Err(MuxError::Truncated);
        }
        let header = Header::parse(&self.buf[..HEADER_LEN])?;
        if header.is_goodbye() {
            self.buf.drain(..HEADER_LEN);
            return Ok(None);
        }
        let total = HEADER_LEN + header.body_len as usize;
        if !self.fill(total).await? {
            return Err(MuxError::Truncated);
        }
        let body = self.buf[HEADER_LEN..total].to_vec();
        self.buf.drain(..total);
        Ok(Some(Packet::from_parts(header, body)))
    }
}

async fn write_loop<W>(
    mut writer: BoxWriter<W>,
    mut rx: mpsc::Receiver<Packet>,
    cancel: CancellationToken,
) -> Result<(), MuxError>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let pkt = tokio::select! {
            biased;
            pkt = rx.recv() => pkt,
            () = cancel.cancelled() => break,
        };
        let Some(pkt) = pkt else { break };
        let bytes = pkt.serialize()?;
        tokio::select! {
            res = writer.write_all(&bytes) => res?,
            () = cancel.cancelled() => return Ok(()),
        }
    }

    let farewell = async {
        while let Ok(pkt) = rx.try_recv() {
            writer.write_all(&pkt.serialize()?).await?;
        }
        writer.write_all(&Header::GOODBYE).await?;
        writer.shutdown().await?;
        Ok::<(), MuxError>(())
    };
    match tokio::time::timeout(CLOSE_FLUSH, farewell).await {
        Ok(res) => res,
        Err(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::muxrpc::{AsyncHandler, DuplexHandler, SourceHandler};
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl AsyncHandler for Echo {
        async fn handle_async(&self, req: &Request) -> Result<Value, CallError> {
            Ok(req.args.clone())
        }
    }

    struct Count;

    #[async_trait]
    impl SourceHandler for Count {
        async fn handle_source(&self, req: &Request, mut sink: ByteSink) -> Result<(), CallError> {
            let n: u32 = req.first_arg()?;
            for i in 0..n {
                sink.write_json(&i).await?;
            }
            Ok(())
        }
    }

    struct Fail;

    #[async_trait]
    impl SourceHandler for Fail {
        async fn handle_source(&self, _req: &Request, _sink: ByteSink) -> Result<(), CallError> {
            Err(CallError::Unauthorized("go away".to_string()))
        }
    }

    struct Upper;

    #[async_trait]
    impl DuplexHandler for Upper {
        async fn handle_duplex(
            &self,
            _req: &Request,
            mut source: ByteSource,
            mut sink: ByteSink,
        ) -> Result<(), CallError> {
            while let Some(body) = source.next().await? {
                sink.write(&body.data.to_ascii_uppercase()).await?;
            }
            Ok(())
        }
    }

    struct Stall;

    #[async_trait]
    impl DuplexHandler for Stall {
        async fn handle_duplex(
            &self,
            req: &Request,
            _source: ByteSource,
            _sink: ByteSink,
        ) -> Result<(), CallError> {
            req.context().cancelled().await;
            Ok(())
        }
    }

    fn pair(server_mux: HandlerMux) -> (Endpoint, Endpoint, CancellationToken) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let k1 = [1u8; 32];
        let k2 = [2u8; 32];
        let n1 = [3u8; 24];
        let n2 = [4u8; 24];
        let root = CancellationToken::new();

        let (server, serve_server) = start_session(
            BoxReader::new(ar, &k1, n1),
            BoxWriter::new(aw, &k2, n2),
            FeedRef::ed25519([0xAA; 32]),
            Arc::new(server_mux),
            root.child_token(),
        );
        let (client, serve_client) = start_session(
            BoxReader::new(br, &k2, n2),
            BoxWriter::new(bw, &k1, n1),
            FeedRef::ed25519([0xBB; 32]),
            Arc::new(HandlerMux::new()),
            root.child_token(),
        );
        tokio::spawn(serve_server);
        tokio::spawn(serve_client);
        (server, client, root)
    }

    fn server_mux() -> HandlerMux {
        let mut mux = HandlerMux::new();
        mux.register_async("echo", Arc::new(Echo));
        mux.register_source("count", Arc::new(Count));
        mux.register_source("fail", Arc::new(Fail));
        mux.register_duplex("upper", Arc::new(Upper));
        mux
    }

    async fn within<F: Future>(f: F) -> F::Output {
        tokio::time::timeout(Duration::from_secs(5), f)
            .await
            .expect("timed out")
    }

    #[tokio::test]
    async fn async_call_returns_value() {
        let (_server, client, _root) = pair(server_mux());
        let body = within(client.call_async("echo".into(), json!(["hi", 2]))).await.unwrap();
        assert_eq!(body.json::<Value>().unwrap(), json!(["hi", 2]));
    }

    #[tokio::test]
    async fn unknown_method_is_reported() {
        let (_server, client, _root) = pair(server_mux());
        let err = within(client.call_async("nope".into(), json!([]))).await.unwrap_err();
        assert_eq!(err, CallError::Remote("method not found".to_string()));
    }

    #[tokio::test]
    async fn shape_mismatch_is_reported() {
        let (_server, client, _root) = pair(server_mux());
        let err = within(client.call_async("count".into(), json!([1]))).await.unwrap_err();
        assert_eq!(err, CallError::Remote("wrong call type".to_string()));
    }

    #[tokio::test]
    async fn source_streams_then_ends() {
        let (_server, client, _root) = pair(server_mux());
        let mut src = within(client.source("count".into(), json!([3]))).await.unwrap();
        let mut got = Vec::new();
        while let Some(n) = within(src.next_json::<u32>()).await.unwrap() {
            got.push(n);
        }
        assert_eq!(got, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn handler_error_terminates_stream() {
        let (_server, client, _root) = pair(server_mux());
        let mut src = within(client.source("fail".into(), json!([]))).await.unwrap();
        let err = within(src.next()).await.unwrap_err();
        assert_eq!(err, StreamError::Remote("go away".to_string()));
    }

    #[tokio::test]
    async fn duplex_round_trip_preserves_frames() {
        let (_server, client, _root) = pair(server_mux());
        let (mut src, mut sink) = within(client.duplex("upper".into(), json!([]))).await.unwrap();
        sink.write(b"hello").await.unwrap();
        sink.write(b"world").await.unwrap();
        assert_eq!(within(src.next()).await.unwrap().unwrap().data, b"HELLO");
        assert_eq!(within(src.next()).await.unwrap().unwrap().data, b"WORLD");
        sink.close().await.unwrap();
        assert!(within(src.next()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn session_end_fails_pending_streams() {
        let (server, client, _root) = pair(server_mux());
        let (mut src, _sink) = within(client.duplex("upper".into(), json!([]))).await.unwrap();
        server.terminate();
        let err = within(src.next()).await.unwrap_err();
        assert!(matches!(err, StreamError::SessionEnded | StreamError::Cancelled));
        within(client.context().cancelled()).await;
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn stalled_stream_does_not_block_session() {
        let mut mux = server_mux();
        mux.register_duplex("stall", Arc::new(Stall));
        let (_server, client, _root) = pair(mux);
        let (mut src, mut sink) = within(client.duplex("stall".into(), json!([]))).await.unwrap();
        for i in 0..SOURCE_QUEUE + 8 {
            within(sink.write(&i.to_be_bytes())).await.unwrap();
        }

        let body = within(client.call_async("echo".into(), json!(["still here"]))).await.unwrap();
        assert_eq!(body.json::<Value>().unwrap(), json!(["still here"]));

        let err = within(src.next()).await.unwrap_err();
        assert_eq!(err, StreamError::Remote("stream buffer overflow".to_string()));
    }

    #[tokio::test]
    async fn finished_streams_are_forgotten() {
        let (server, client, _root) = pair(server_mux());
        let (mut src, sink) = within(client.duplex("upper".into(), json!([]))).await.unwrap();
        sink.close().await.unwrap();
        assert!(within(src.next()).await.unwrap().is_none());
        within(async {
            while client.open_streams() > 0 || server.open_streams() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
    }
}
