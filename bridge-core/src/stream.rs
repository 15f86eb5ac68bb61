//! Producer/consumer stream plumbing (§9 "Streaming as producer/consumer
//! queues"): the single place where the decoupling between a transport
//! event arriving on some Go thread and a script calling `recv()` on the
//! loop lives. Both the client-side Stream Controller (§3) and the
//! server-side Call Context's streaming operations (§4.5) are built from
//! the same two halves, [`Outbound`] and [`Inbound`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use futures::Stream;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, Notify};

use crate::error::{BridgeError, GrpcError, Result};
use crate::message::MessageHandle;

/// Shared cancellation flag plus a one-shot subscription hook, observed by
/// `call.cancelled` / the Stream Controller's send and recv paths (§3, §4.5,
/// §5 "Cancellation").
#[derive(Clone)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Cancellation {
    pub fn new() -> Self {
        Cancellation {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Idempotent: the second and later calls are no-ops (§5 "Cancellation
    /// is idempotent").
    pub fn cancel(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    /// Resolves immediately if already cancelled, otherwise waits for the
    /// next `cancel()` call. This is the Call Context's "one-shot
    /// subscription that fires at that moment" (§4.5).
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Cancellation::new()
    }
}

/// One event delivered to the consumer side of a stream: a decoded message,
/// or a terminal error (the peer finished non-OK, or some other delivery
/// failure). The absence of a further event (channel closed) signals a
/// clean end of stream.
pub enum StreamEvent {
    Message(MessageHandle),
    Error(GrpcError),
}

/// `{value, done}`, shaped like a standard async-iterator step (§3).
#[derive(Debug, Clone)]
pub struct RecvStep {
    pub value: Option<MessageHandle>,
    pub done: bool,
}

impl RecvStep {
    pub fn done() -> Self {
        RecvStep { value: None, done: true }
    }

    pub fn item(value: MessageHandle) -> Self {
        RecvStep { value: Some(value), done: false }
    }
}

/// Producer side of a stream direction: `send(msg)` pushes, `end()` closes.
/// `send` returns once the message is accepted into the bounded channel
/// (§4.3 "Backpressure policy": accepted into the outbound buffer, not
/// acknowledged by the peer).
pub struct Outbound {
    tx: StdMutex<Option<mpsc::Sender<StreamEvent>>>,
    cancellation: Cancellation,
}

impl Outbound {
    pub fn new(tx: mpsc::Sender<StreamEvent>, cancellation: Cancellation) -> Self {
        Outbound { tx: StdMutex::new(Some(tx)), cancellation }
    }

    pub async fn send(&self, msg: MessageHandle) -> Result<()> {
        if self.cancellation.is_cancelled() {
            return Err(GrpcError::cancelled().into());
        }
        let sender = self.tx.lock().expect("outbound lock poisoned").clone();
        match sender {
            Some(tx) => tx
                .send(StreamEvent::Message(msg))
                .await
                .map_err(|_| BridgeError::InvalidState("stream already closed by the peer".into())),
            None => Err(BridgeError::InvalidState("send after end".into())),
        }
    }

    /// Delivers a terminal error to the consumer side instead of a clean
    /// end of stream (used by the in-process transport's dispatcher to
    /// surface a handler failure to the peer, §4.4 step 6).
    pub async fn fail(&self, err: GrpcError) {
        let sender = self.tx.lock().expect("outbound lock poisoned").take();
        if let Some(tx) = sender {
            let _ = tx.send(StreamEvent::Error(err)).await;
        }
    }

    /// Closes the outbound direction. Idempotent.
    pub fn end(&self) {
        *self.tx.lock().expect("outbound lock poisoned") = None;
    }

    pub fn is_open(&self) -> bool {
        self.tx.lock().expect("outbound lock poisoned").is_some()
    }
}

/// Consumer side of a stream direction: `recv()` returns the next step, at
/// most one outstanding call at a time (§4.3 "two concurrent recv() calls
/// on the same stream is an error").
pub struct Inbound {
    rx: AsyncMutex<mpsc::Receiver<StreamEvent>>,
    recv_in_flight: AtomicBool,
    cancellation: Cancellation,
    done: AtomicBool,
}

impl Inbound {
    pub fn new(rx: mpsc::Receiver<StreamEvent>, cancellation: Cancellation) -> Self {
        Inbound {
            rx: AsyncMutex::new(rx),
            recv_in_flight: AtomicBool::new(false),
            cancellation,
            done: AtomicBool::new(false),
        }
    }

    /// `recv` after `done` yields repeated `{done:true}` (§4.5).
    pub async fn recv(&self) -> Result<RecvStep> {
        if self.done.load(Ordering::SeqCst) {
            return Ok(RecvStep::done());
        }
        if self.cancellation.is_cancelled() {
            self.done.store(true, Ordering::SeqCst);
            return Err(GrpcError::cancelled().into());
        }
        if self.recv_in_flight.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::InvalidState(
                "concurrent recv() on the same stream is an error".into(),
            ));
        }

        let outcome = {
            let mut rx = self.rx.lock().await;
            tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => None,
                item = rx.recv() => Some(item),
            }
        };
        self.recv_in_flight.store(false, Ordering::SeqCst);

        match outcome {
            None => {
                self.done.store(true, Ordering::SeqCst);
                Err(GrpcError::cancelled().into())
            }
            Some(None) => {
                self.done.store(true, Ordering::SeqCst);
                Ok(RecvStep::done())
            }
            Some(Some(StreamEvent::Message(handle))) => Ok(RecvStep::item(handle)),
            Some(Some(StreamEvent::Error(err))) => {
                self.done.store(true, Ordering::SeqCst);
                Err(err.into())
            }
        }
    }

    /// Adapts repeated `recv()` calls into a `futures::Stream`: the shape
    /// `bridge-quickjs` drives into a JS async iterator (a JS generator
    /// pulls one item per `next()`, the same rhythm a `Stream::poll_next`
    /// consumer already has). Ends after the first `done` step or error,
    /// matching `recv()`'s own one-shot-terminal behavior.
    pub fn stream(&self) -> impl Stream<Item = Result<RecvStep>> + '_ {
        async_stream::stream! {
            loop {
                let step = self.recv().await;
                let terminal = matches!(&step, Ok(s) if s.done) || step.is_err();
                yield step;
                if terminal {
                    break;
                }
            }
        }
    }
}

/// Stream Controller (client side, §3): returned from client-streaming and
/// bidi client methods. `response` is populated only for client-streaming
/// (§4.3: "`.response` is a Promise resolving with the final response").
pub struct StreamController {
    outbound: Option<Outbound>,
    inbound: Option<Inbound>,
    response: Option<AsyncMutex<Option<oneshot::Receiver<std::result::Result<MessageHandle, GrpcError>>>>>,
}

impl StreamController {
    pub fn new(
        outbound: Option<Outbound>,
        inbound: Option<Inbound>,
        response: Option<oneshot::Receiver<std::result::Result<MessageHandle, GrpcError>>>,
    ) -> Self {
        StreamController {
            outbound,
            inbound,
            response: response.map(|r| AsyncMutex::new(Some(r))),
        }
    }

    pub async fn send(&self, msg: MessageHandle) -> Result<()> {
        match &self.outbound {
            Some(out) => out.send(msg).await,
            None => Err(BridgeError::InvalidState("this stream has no outbound direction".into())),
        }
    }

    pub fn end(&self) {
        if let Some(out) = &self.outbound {
            out.end();
        }
    }

    pub async fn recv(&self) -> Result<RecvStep> {
        match &self.inbound {
            Some(inb) => inb.recv().await,
            None => Err(BridgeError::InvalidState("this stream has no inbound direction".into())),
        }
    }

    /// Await the final response (client-streaming mode only).
    pub async fn response(&self) -> Result<MessageHandle> {
        let slot = self
            .response
            .as_ref()
            .ok_or_else(|| BridgeError::InvalidState(".response is only available for client-streaming calls".into()))?;
        let receiver = slot.lock().await.take();
        match receiver {
            Some(rx) => rx
                .await
                .map_err(|_| BridgeError::InvalidState("response channel dropped before resolving".into()))?
                .map_err(Into::into),
            None => Err(BridgeError::InvalidState(".response already awaited".into())),
        }
    }
}
