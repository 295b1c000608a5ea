//! # Reference Table
//!
//! One session's view of distributed references: what it has exported to its
//! peer (counts live in the shared [`ExportTable`]) and which of the peer's
//! objects it currently holds proxies for.
//!
//! ## Invariants
//!
//! - **One import per id**: while any clone of a proxy for `id` is alive,
//!   receiving `id` again returns that proxy and bumps its received count.
//! - **Exact release**: a dropped import releases exactly the number of times
//!   it was received, so a reference that was in flight when the last clone
//!   dropped is still covered by the exporter's count.

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::Result;
use crate::exports::ExportTable;
use crate::exports::Exported;
use crate::handles::ObjectId;
use crate::handles::PeerId;
use crate::proxy::Proxy;
use crate::proxy::ProxyInner;
use crate::session::SessionShared;

struct Import {
    token: u64,
    proxy: Weak<ProxyInner>,
}

pub(crate) struct RefTable {
    peer: PeerId,
    exports: Arc<ExportTable>,
    imports: DashMap<ObjectId, Import>,
    next_token: AtomicU64,
}

impl RefTable {
    pub(crate) fn new(peer: PeerId, exports: Arc<ExportTable>) -> Self {
        Self {
            peer,
            exports,
            imports: DashMap::new(),
            next_token: AtomicU64::new(1),
        }
    }

    pub(crate) fn exports(&self) -> &Arc<ExportTable> {
        &self.exports
    }

    /// Exports `target` to this session's peer (+1). Fails once the session has torn down.
    pub(crate) fn export_for(&self, target: Exported) -> Result<ObjectId> {
        self.exports.export(self.peer, target)
    }

    /// Applies a release from this session's peer.
    pub(crate) fn release(&self, id: ObjectId, count: u64) -> Result<()> {
        self.exports.release(self.peer, id, count)
    }

    pub(crate) fn resolve(&self, id: ObjectId) -> Option<Exported> {
        self.exports.resolve(self.peer, id)
    }

    /// Returns the proxy for a received reference, creating it on first receipt.
    ///
    /// `receipts` is how many exporter-side counts this receipt stands for:
    /// one for a decoded `ref`, zero for a root handle that the server
    /// pre-exported on its own.
    pub(crate) fn import_proxy(&self, session: &Arc<SessionShared>, id: ObjectId, receipts: u64) -> Proxy {
        match self.imports.entry(id) {
            Entry::Occupied(mut slot) => {
                if let Some(inner) = slot.get().proxy.upgrade() {
                    inner.received.fetch_add(receipts, Ordering::AcqRel);
                    return Proxy::from_inner(inner);
                }
                let (proxy, import) = self.fresh(session, id, receipts);
                slot.insert(import);
                proxy
            }
            Entry::Vacant(slot) => {
                let (proxy, import) = self.fresh(session, id, receipts);
                slot.insert(import);
                proxy
            }
        }
    }

    fn fresh(&self, session: &Arc<SessionShared>, id: ObjectId, receipts: u64) -> (Proxy, Import) {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let proxy = Proxy::new(Arc::clone(session), id, token, receipts);
        let import = Import { token, proxy: proxy.downgrade() };
        (proxy, import)
    }

    /// Forgets an import whose last clone dropped, unless it has already been replaced.
    pub(crate) fn forget_import(&self, id: ObjectId, token: u64) {
        self.imports.remove_if(&id, |_, import| import.token == token);
    }

    /// Number of distinct live imports.
    pub(crate) fn imports(&self) -> usize {
        self.imports.len()
    }

    /// Session teardown: zero every count the peer holds and forget every import.
    pub(crate) fn release_all(&self) -> usize {
        self.imports.clear();
        self.exports.release_all(self.peer)
    }
}
