//! # Proxies
//!
//! A `Proxy` is the local handle to an object that lives on the other side of
//! a session. Clones share a single import; when the last clone is dropped the
//! owning session tells the peer to release every count this import received.

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::error::Result;
use crate::handles::ObjectId;
use crate::session::Session;
use crate::session::SessionShared;
use crate::value::Value;

pub(crate) struct ProxyInner {
    pub(crate) session: Arc<SessionShared>,
    pub(crate) id: ObjectId,
    pub(crate) received: AtomicU64,
    token: u64,
}

impl Drop for ProxyInner {
    fn drop(&mut self) {
        let received = *self.received.get_mut();
        self.session.proxy_dropped(self.id, self.token, received);
    }
}

#[derive(Clone)]
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

impl Proxy {
    pub(crate) fn new(session: Arc<SessionShared>, id: ObjectId, token: u64, received: u64) -> Self {
        Self {
            inner: Arc::new(ProxyInner {
                session,
                id,
                received: AtomicU64::new(received),
                token,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ProxyInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<ProxyInner> {
        Arc::downgrade(&self.inner)
    }

    /// Invokes `method` on the remote object and waits for its result.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.inner.session.call(self.inner.id, method, args).await
    }

    /// Lists the remote object's method names.
    pub async fn dir(&self) -> Result<Vec<String>> {
        let listing = self.call("_dir", Vec::new()).await?;
        Ok(listing
            .as_list()
            .unwrap_or_default()
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect())
    }

    /// Gives up this handle.
    ///
    /// The peer is told once the last clone is gone; calls already in flight
    /// through other clones are unaffected.
    pub fn release(self) {
        drop(self);
    }

    /// The id the remote side exported this object under.
    pub fn id(&self) -> ObjectId {
        self.inner.id
    }

    /// The session this proxy routes calls through.
    pub fn session(&self) -> Session {
        Session::from_shared(Arc::clone(&self.inner.session))
    }

    /// How many times this reference has been received.
    pub fn received(&self) -> u64 {
        self.inner.received.load(Ordering::Acquire)
    }

    pub fn ptr_eq(a: &Proxy, b: &Proxy) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub(crate) fn belongs_to(&self, session: &Arc<SessionShared>) -> bool {
        Arc::ptr_eq(&self.inner.session, session)
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Proxy({}@{})", self.inner.id, self.inner.session.peer)
    }
}
