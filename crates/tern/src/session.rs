//! # Sessions
//!
//! One `Session` per connection. It owns the channel, the table of calls it is
//! waiting on, the calls it is serving and its [`RefTable`].
//!
//! ## Tasks
//!
//! - **Receive loop**: reads frames in order and handles each one without
//!   awaiting application code. Calls are resolved, decoded and pinned here,
//!   then handed to a task of their own.
//! - **Writer**: the only task that sends. It drains a single queue so frames
//!   never interleave, and folds runs of queued releases into one `refDelta`.
//! - **One task per inbound call.**
//!
//! ## Lifecycle
//!
//! `Connecting → Open → Draining → Closed`. Draining starts on `close()`, on
//! end-of-stream, on a transport error or on a session-fatal protocol error.
//! It fails every pending call with `SessionClosed`, drops every count the peer
//! held, closes the channel and only then reports `Closed`.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tracing::Instrument;

use ternwire::CallEncoder;
use ternwire::Delta;
use ternwire::Frame;
use ternwire::RefDeltaEncoder;

use crate::channel::Channel;
use crate::codec;
use crate::codec::Codec;
use crate::config::SessionConfig;
use crate::dispatch;
use crate::error::Error;
use crate::error::RemoteError;
use crate::error::Result;
use crate::exports::ExportTable;
use crate::handles::ObjectId;
use crate::handles::PeerId;
use crate::proxy::Proxy;
use crate::refs::RefTable;
use crate::value::Value;

/// Upper bound on queued messages the writer folds into one flush.
const WRITE_BATCH: usize = 64;

/// Abandoned call ids remembered individually before the oldest are folded
/// into a watermark.
const ABANDONED_LIMIT: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Connecting,
    Open,
    Draining,
    Closed,
}

/// Counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Calls this side has issued.
    pub calls_sent: u64,
    /// Calls the peer has issued to this side.
    pub calls_served: u64,
    /// Calls issued and not yet resolved.
    pub pending: usize,
    /// Distinct proxies currently held into the peer.
    pub imports: usize,
}

enum Outbound {
    Frame(Vec<u8>),
    Release(ObjectId, u64),
    Shutdown,
}

type Reply = Result<Value>;

/// Calls whose callers stopped waiting, so a late reply can be told apart
/// from a reply to something this side never sent.
///
/// At most `limit` ids are kept. Evicting one raises `evicted_upto`, and since
/// ids are issued in order any reply at or below it is treated as late.
struct Abandoned {
    ids: HashSet<u64>,
    order: VecDeque<u64>,
    evicted_upto: u64,
    limit: usize,
}

impl Abandoned {
    fn new(limit: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            evicted_upto: 0,
            limit,
        }
    }

    fn insert(&mut self, cid: u64) {
        if !self.ids.insert(cid) {
            return;
        }
        self.order.push_back(cid);
        while self.order.len() > self.limit {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if self.ids.remove(&oldest) {
                self.evicted_upto = self.evicted_upto.max(oldest);
            }
        }
    }

    /// Whether a reply for `cid` answers an abandoned call.
    fn claim(&mut self, cid: u64) -> bool {
        self.ids.remove(&cid) || cid <= self.evicted_upto
    }

    fn clear(&mut self) {
        self.ids.clear();
        self.order.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.ids.len()
    }
}

pub(crate) struct SessionShared {
    pub(crate) peer: PeerId,
    pub(crate) config: SessionConfig,
    pub(crate) refs: RefTable,
    pending: DashMap<u64, oneshot::Sender<Reply>>,
    abandoned: Mutex<Abandoned>,
    running: DashMap<u64, ()>,
    next_cid: AtomicU64,
    outbound: mpsc::UnboundedSender<Outbound>,
    state: watch::Sender<SessionState>,
    calls_sent: AtomicU64,
    calls_served: AtomicU64,
    finished: AtomicBool,
}

impl SessionShared {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn abandoned(&self) -> MutexGuard<'_, Abandoned> {
        self.abandoned.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Moves an open session to `Draining`. Returns whether this call did it.
    fn begin_drain(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state < SessionState::Draining {
                *state = SessionState::Draining;
                true
            } else {
                false
            }
        })
    }

    /// Issues a call and waits for its reply.
    pub(crate) async fn call(self: &Arc<Self>, target: ObjectId, method: &str, args: Vec<Value>) -> Result<Value> {
        if self.state() != SessionState::Open {
            return Err(Error::SessionClosed);
        }

        let cid = self.next_cid.fetch_add(1, Ordering::Relaxed);
        let args = Codec::new(self).encode_args(&args)?;
        let framed = CallEncoder::new(cid, target.0, method, &args.bytes).into_bytes();
        let frame = match framed {
            Ok(bytes) if bytes.len() <= self.config.max_frame_size => bytes,
            Ok(bytes) => {
                args.rollback(self);
                return Err(Error::Encode(format!("call of {} bytes exceeds frame limit", bytes.len())));
            }
            Err(e) => {
                args.rollback(self);
                return Err(Error::Encode(e.to_string()));
            }
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(cid, tx);
        let mut slot = PendingSlot { session: self, cid, resolved: false };

        // A drain that started after the state check above has already swept
        // `pending`; don't wait on a slot nobody will fill.
        if self.state() != SessionState::Open {
            args.rollback(self);
            return Err(Error::SessionClosed);
        }

        self.calls_sent.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(peer = %self.peer, cid, object = %target, method, "call");
        if self.outbound.send(Outbound::Frame(frame)).is_err() {
            args.rollback(self);
            return Err(Error::SessionClosed);
        }

        let reply = match self.config.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    tracing::debug!(peer = %self.peer, cid, "call timed out");
                    return Err(Error::Timeout);
                }
            },
            None => rx.await,
        };
        slot.resolved = true;

        match reply {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::SessionClosed),
        }
    }

    /// Called when the last clone of a proxy into this session is dropped.
    pub(crate) fn proxy_dropped(&self, id: ObjectId, token: u64, received: u64) {
        self.refs.forget_import(id, token);
        if received > 0 && self.state() == SessionState::Open {
            let _ = self.outbound.send(Outbound::Release(id, received));
        }
    }

    /// Queues a reply. If the writer is already gone the reply's exports are given back.
    fn send_reply(&self, reply: dispatch::Outgoing) {
        if self.outbound.send(Outbound::Frame(reply.bytes)).is_err() {
            tracing::debug!(peer = %self.peer, exports = reply.exported.len(), "reply dropped, session gone");
            codec::rollback(self, &reply.exported);
        }
    }

    /// Handles one inbound frame. An error return is fatal to the session.
    fn handle_frame(self: &Arc<Self>, bytes: &[u8]) -> Result<()> {
        match Frame::decode(bytes)? {
            Frame::Call(call) => {
                let cid = call.correlation;
                if self.running.insert(cid, ()).is_some() {
                    return Err(Error::Protocol(format!("correlation id {} reused while running", cid)));
                }
                self.calls_served.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(peer = %self.peer, cid, object = call.target, method = call.method, "serve");

                match dispatch::prepare(self, call) {
                    Ok(prepared) => self.spawn_invocation(prepared),
                    Err(e) if e.is_session_fatal() => return Err(e),
                    Err(e) => {
                        self.running.remove(&cid);
                        if let Some(reply) = dispatch::error_reply(self, cid, e) {
                            self.send_reply(reply);
                        }
                    }
                }
            }
            Frame::Result(result) => {
                let cid = result.correlation;
                let decoded = self.claim_reply(cid)
                    .map(|slot| (slot, Codec::new(self).decode(result.value)));
                match decoded {
                    Some((Some(tx), Ok(value))) => {
                        let _ = tx.send(Ok(value));
                    }
                    Some((Some(tx), Err(e))) => {
                        let fatal = e.is_session_fatal();
                        let _ = tx.send(Err(e.clone()));
                        if fatal {
                            return Err(e);
                        }
                    }
                    Some((None, Err(e))) if e.is_session_fatal() => return Err(e),
                    Some((None, _)) => {
                        tracing::debug!(peer = %self.peer, cid, "dropped late result");
                    }
                    None => return Err(Error::Protocol(format!("result for unknown correlation id {}", cid))),
                }
            }
            Frame::Error(error) => {
                let cid = error.correlation;
                let Some(slot) = self.claim_reply(cid) else {
                    return Err(Error::Protocol(format!("error for unknown correlation id {}", cid)));
                };
                let data = match error.data {
                    Some(dec) => match Codec::new(self).decode(dec) {
                        Ok(value) => Some(Box::new(value)),
                        Err(e) if e.is_session_fatal() => return Err(e),
                        Err(_) => None,
                    },
                    None => None,
                };
                let remote = RemoteError {
                    kind: error.kind,
                    message: error.message.to_string(),
                    data,
                };
                match slot {
                    Some(tx) => {
                        let _ = tx.send(Err(Error::Remote(remote)));
                    }
                    None => tracing::debug!(peer = %self.peer, cid, "dropped late error"),
                }
            }
            Frame::RefDelta(frame) => {
                for delta in frame.deltas {
                    let id = ObjectId(delta.object);
                    if delta.delta > 0 {
                        return Err(Error::Protocol(format!("positive delta {} for {}", delta.delta, id)));
                    }
                    if delta.delta < 0 {
                        self.refs.release(id, delta.delta.unsigned_abs())?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Finds who is waiting on `cid`.
    ///
    /// `Some(Some(tx))` is a live caller, `Some(None)` a caller that gave up
    /// and `None` an id this side never issued.
    fn claim_reply(&self, cid: u64) -> Option<Option<oneshot::Sender<Reply>>> {
        if let Some((_, tx)) = self.pending.remove(&cid) {
            return Some(Some(tx));
        }
        self.abandoned().claim(cid).then_some(None)
    }

    fn spawn_invocation(self: &Arc<Self>, mut prepared: dispatch::Prepared) {
        let session = Arc::clone(self);
        let span = tracing::debug_span!("invoke", cid = prepared.correlation, object = %prepared.id);
        tokio::spawn(
            async move {
                let outcome = dispatch::invoke(&mut prepared).await;
                if let Err(e) = &outcome {
                    tracing::debug!(error = %e, "call failed");
                }
                let cid = prepared.correlation;
                let reply = dispatch::reply(&session, cid, outcome);
                session.running.remove(&cid);
                if let Some(reply) = reply {
                    session.send_reply(reply);
                }
                drop(prepared);
            }
            .instrument(span),
        );
    }

    /// Tears the session down. Runs once, from the receive loop.
    async fn finish(&self, writer: tokio::task::JoinHandle<()>, channel: &dyn Channel) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.begin_drain();

        let keys: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, tx)) = self.pending.remove(&key) {
                let _ = tx.send(Err(Error::SessionClosed));
            }
        }
        self.abandoned().clear();

        let released = self.refs.release_all();

        let _ = self.outbound.send(Outbound::Shutdown);
        let _ = writer.await;
        if let Err(e) = channel.close().await {
            tracing::debug!(peer = %self.peer, error = %e, "channel close failed");
        }

        self.state.send_replace(SessionState::Closed);
        tracing::info!(peer = %self.peer, released, "session closed");
    }
}

/// Removes an outstanding slot when its caller stops waiting before the reply.
///
/// Covers both timeouts and callers that drop the call future. The id is kept
/// as abandoned so a late reply is recognised and dropped.
struct PendingSlot<'a> {
    session: &'a SessionShared,
    cid: u64,
    resolved: bool,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        if self.session.pending.remove(&self.cid).is_some() && self.session.state() == SessionState::Open {
            self.session.abandoned().insert(self.cid);
        }
    }
}

/// A handle to one connection. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    /// Starts a session over an already-connected channel.
    ///
    /// `exports` is the table shared with every other session of the same
    /// server or client; `peer` must come from that table's `next_peer()`.
    pub fn open(channel: Arc<dyn Channel>, exports: Arc<ExportTable>, peer: PeerId, config: SessionConfig) -> Self {
        let (outbound, queue) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SessionState::Connecting);

        let shared = Arc::new(SessionShared {
            peer,
            config,
            refs: RefTable::new(peer, exports),
            pending: DashMap::new(),
            abandoned: Mutex::new(Abandoned::new(ABANDONED_LIMIT)),
            running: DashMap::new(),
            next_cid: AtomicU64::new(1),
            outbound,
            state,
            calls_sent: AtomicU64::new(0),
            calls_served: AtomicU64::new(0),
            finished: AtomicBool::new(false),
        });

        let span = tracing::info_span!("session", peer = %peer);
        let writer = tokio::spawn(
            write_loop(Arc::clone(&shared), Arc::clone(&channel), queue).instrument(span.clone()),
        );
        shared.state.send_replace(SessionState::Open);
        tokio::spawn(receive_loop(Arc::clone(&shared), channel, writer).instrument(span));

        tracing::debug!(%peer, "session open");
        Self { shared }
    }

    pub(crate) fn from_shared(shared: Arc<SessionShared>) -> Self {
        Self { shared }
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    pub fn peer(&self) -> PeerId {
        self.shared.peer
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Invokes `method` on the peer's object `target`.
    pub async fn call(&self, target: ObjectId, method: &str, args: Vec<Value>) -> Result<Value> {
        self.shared.call(target, method, args).await
    }

    /// A proxy for one of the peer's roots.
    ///
    /// The peer pre-exports its roots to every session, so this handle does not
    /// add to its count and dropping it releases nothing.
    pub fn root(&self, index: u64) -> Proxy {
        self.shared.refs.import_proxy(&self.shared, ObjectId(index), 0)
    }

    /// Starts draining and waits until the session is closed.
    pub async fn close(&self) {
        if self.shared.begin_drain() {
            tracing::debug!(peer = %self.shared.peer, "close requested");
        }
        self.closed().await;
    }

    /// Resolves once the session has reached `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|state| *state == SessionState::Closed).await;
    }

    pub fn exports(&self) -> &Arc<ExportTable> {
        self.shared.refs.exports()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            calls_sent: self.shared.calls_sent.load(Ordering::Relaxed),
            calls_served: self.shared.calls_served.load(Ordering::Relaxed),
            pending: self.shared.pending.len(),
            imports: self.shared.refs.imports(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Session({}, {:?})", self.shared.peer, self.state())
    }
}

async fn receive_loop(shared: Arc<SessionShared>, channel: Arc<dyn Channel>, writer: tokio::task::JoinHandle<()>) {
    let mut state = shared.state.subscribe();
    loop {
        let frame = tokio::select! {
            frame = channel.recv() => frame,
            _ = state.wait_for(|s| *s >= SessionState::Draining) => break,
        };
        match frame {
            Ok(Some(bytes)) => {
                if let Err(e) = shared.handle_frame(&bytes) {
                    tracing::warn!(error = %e, "closing session on fatal error");
                    break;
                }
            }
            Ok(None) => {
                tracing::debug!("peer closed the channel");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "channel failed");
                break;
            }
        }
    }
    shared.finish(writer, channel.as_ref()).await;
}

async fn write_loop(shared: Arc<SessionShared>, channel: Arc<dyn Channel>, mut queue: mpsc::UnboundedReceiver<Outbound>) {
    let mut deltas: Vec<Delta> = Vec::new();
    while let Some(first) = queue.recv().await {
        let mut batch = vec![first];
        while batch.len() < WRITE_BATCH {
            match queue.try_recv() {
                Ok(next) => batch.push(next),
                Err(_) => break,
            }
        }

        for msg in batch {
            let sent = match msg {
                Outbound::Release(id, count) => {
                    let delta = i64::try_from(count).map_or(i64::MIN, |c| -c);
                    deltas.push(Delta { object: id.0, delta });
                    Ok(())
                }
                Outbound::Frame(bytes) => match flush_deltas(channel.as_ref(), &mut deltas).await {
                    Ok(()) => channel.send(&bytes).await,
                    Err(e) => Err(e),
                },
                Outbound::Shutdown => {
                    // Counts are zeroed on both sides at teardown; unsent releases are moot.
                    return;
                }
            };
            if let Err(e) = sent {
                tracing::warn!(error = %e, "send failed");
                shared.begin_drain();
                return;
            }
        }

        if let Err(e) = flush_deltas(channel.as_ref(), &mut deltas).await {
            tracing::warn!(error = %e, "send failed");
            shared.begin_drain();
            return;
        }
    }
}

async fn flush_deltas(channel: &dyn Channel, deltas: &mut Vec<Delta>) -> std::result::Result<(), crate::channel::ChannelError> {
    if deltas.is_empty() {
        return Ok(());
    }
    tracing::debug!(count = deltas.len(), "releasing references");
    let frame = RefDeltaEncoder::new(deltas).into_bytes();
    deltas.clear();
    match frame {
        Ok(bytes) => channel.send(&bytes).await,
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode refDelta");
            Ok(())
        }
    }
}
