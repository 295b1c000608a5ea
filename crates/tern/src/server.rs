//! # Roots, Servers and Clients
//!
//! A server is configured with an explicit, ordered set of root objects. Root
//! *i* is exported under `ObjectId(i)` and pre-exported to every peer when its
//! session starts, so a client can address roots without asking for them.
//!
//! A root is either one object shared by every session or a factory that
//! builds a fresh object per session, for roots that keep per-peer state.
//!
//! Every server (and every client that exposes objects of its own) owns one
//! export table shared by all of its sessions. Nothing here is process-global.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;

use crate::channel::Channel;
use crate::channel::Listener;
use crate::config::SessionConfig;
use crate::exports::ExportTable;
use crate::exports::Exported;
use crate::handles::ObjectId;
use crate::handles::PeerId;
use crate::object::Object;
use crate::proxy::Proxy;
use crate::session::Session;

/// Makes a fresh root object for each session.
pub type RootFactory = Arc<dyn Fn() -> Object + Send + Sync>;

#[derive(Clone)]
enum RootSlot {
    Shared(Object),
    PerSession(RootFactory),
}

/// The ordered set of objects a side offers to every peer.
#[derive(Clone, Default)]
pub struct Roots {
    entries: Vec<(String, RootSlot)>,
}

impl Roots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a root shared by every session; its id is its position.
    pub fn with(mut self, name: impl Into<String>, object: Object) -> Self {
        self.entries.push((name.into(), RootSlot::Shared(object)));
        self
    }

    /// Adds a root that `make` builds anew for each session, so its state is
    /// private to one peer. Its id is its position, the same for every peer.
    pub fn with_factory<F>(mut self, name: impl Into<String>, make: F) -> Self
    where
        F: Fn() -> Object + Send + Sync + 'static,
    {
        self.entries.push((name.into(), RootSlot::PerSession(Arc::new(make))));
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// The shared root registered under `name`. Per-session roots have no
    /// single object and return `None`.
    pub fn get(&self, name: &str) -> Option<&Object> {
        self.entries.iter().find(|(n, _)| n == name).and_then(|(_, slot)| match slot {
            RootSlot::Shared(object) => Some(object),
            RootSlot::PerSession(_) => None,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Builds the export table for one server or client, roots at `0..k`.
    fn install(&self) -> Arc<ExportTable> {
        let exports = Arc::new(ExportTable::new());
        for (name, slot) in &self.entries {
            let id = match slot {
                RootSlot::Shared(object) => exports.add_root(object.clone()),
                RootSlot::PerSession(_) => exports.add_root_per_peer(),
            };
            tracing::debug!(root = %name, object = %id, "registered root");
        }
        exports
    }

    /// Starts a session with every root pre-exported to its peer, building
    /// that peer's instance of each per-session root first.
    fn open(&self, exports: &Arc<ExportTable>, channel: Arc<dyn Channel>, config: SessionConfig) -> Session {
        let peer = exports.next_peer();
        for (index, (name, slot)) in self.entries.iter().enumerate() {
            let bound = match slot {
                RootSlot::Shared(object) => exports.export(peer, Exported::Object(object.clone())).map(drop),
                RootSlot::PerSession(make) => exports.bind_root(peer, ObjectId(index as u64), make()),
            };
            if let Err(e) = bound {
                tracing::warn!(%peer, root = %name, error = %e, "root not available to session");
            }
        }
        Session::open(channel, Arc::clone(exports), peer, config)
    }
}

impl std::fmt::Debug for Roots {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

struct ServerInner {
    roots: Roots,
    exports: Arc<ExportTable>,
    config: SessionConfig,
    sessions: DashMap<PeerId, Session>,
    shutdown: watch::Sender<bool>,
}

/// Accepts connections and runs one session per peer.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn bind(roots: Roots, config: SessionConfig) -> Self {
        let exports = roots.install();
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(ServerInner {
                roots,
                exports,
                config,
                sessions: DashMap::new(),
                shutdown,
            }),
        }
    }

    /// Accepts connections until the listener closes or `shutdown` is called.
    pub async fn serve<L: Listener>(&self, mut listener: L) {
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            let channel = tokio::select! {
                channel = listener.accept() => channel,
                _ = shutdown.wait_for(|stop| *stop) => break,
            };
            match channel {
                Some(channel) => {
                    self.accept(Arc::from(channel));
                }
                None => {
                    tracing::info!("listener closed");
                    break;
                }
            }
        }
        tracing::debug!("no longer accepting");
    }

    /// Starts a session for one already-connected channel.
    pub fn accept(&self, channel: Arc<dyn Channel>) -> Session {
        let session = self.inner.roots.open(&self.inner.exports, channel, self.inner.config.clone());
        let peer = session.peer();
        tracing::info!(%peer, "accepted session");
        self.inner.sessions.insert(peer, session.clone());

        let inner = Arc::downgrade(&self.inner);
        let watched = session.clone();
        tokio::spawn(async move {
            watched.closed().await;
            if let Some(inner) = inner.upgrade() {
                inner.sessions.remove(&peer);
            }
        });
        session
    }

    /// Number of live sessions.
    pub fn sessions(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn session(&self, peer: PeerId) -> Option<Session> {
        self.inner.sessions.get(&peer).map(|s| s.clone())
    }

    pub fn exports(&self) -> &Arc<ExportTable> {
        &self.inner.exports
    }

    pub fn roots(&self) -> &Roots {
        &self.inner.roots
    }

    /// Stops accepting and closes every session.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let sessions: Vec<Session> = self.inner.sessions.iter().map(|s| s.value().clone()).collect();
        for session in sessions {
            session.close().await;
        }
    }
}

/// Serves `roots` on `listener` with the default configuration.
pub async fn serve<L: Listener>(listener: L, roots: Roots) {
    Server::bind(roots, SessionConfig::default()).serve(listener).await;
}

/// The client's view of a server's roots.
#[derive(Clone)]
pub struct RootSet {
    session: Session,
    names: Vec<String>,
}

impl RootSet {
    /// Names the server's roots in order, so they can be fetched with `get`.
    pub fn named<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names = names.into_iter().map(Into::into).collect();
        self
    }

    /// A proxy for root `index`.
    pub fn index(&self, index: usize) -> Proxy {
        self.session.root(index as u64)
    }

    /// A proxy for the root registered under `name`.
    pub fn get(&self, name: &str) -> Option<Proxy> {
        self.names.iter().position(|n| n == name).map(|i| self.index(i))
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn close(&self) {
        self.session.close().await;
    }
}

/// Connects to a server over `channel`.
pub fn connect<C: Channel>(channel: C) -> RootSet {
    connect_with(channel, SessionConfig::default(), Roots::new())
}

/// Connects with a custom configuration, exposing `local` roots to the server.
pub fn connect_with<C: Channel>(channel: C, config: SessionConfig, local: Roots) -> RootSet {
    let exports = local.install();
    let session = local.open(&exports, Arc::new(channel), config);
    RootSet { session, names: Vec::new() }
}

impl std::fmt::Debug for RootSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootSet")
            .field("session", &self.session)
            .field("names", &self.names)
            .finish()
    }
}

