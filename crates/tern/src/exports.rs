//! # Export Table
//!
//! Every object this process has made reachable from a peer, keyed by
//! `ObjectId`, with a reference count per peer and a pin count for in-flight
//! calls.
//!
//! ## Invariants
//!
//! - **One id per target**: a target is exported under a single id for as long
//!   as it stays in the table; repeated exports bump counts instead.
//! - **One id per root position**: every `add_root*` call allocates a fresh id,
//!   even for an object that is already a root.
//! - **Non-negative counts**: a release larger than the peer's count is a
//!   protocol error and changes nothing.
//! - **Reclamation**: an entry is removed exactly when it is not a root, no peer
//!   holds a count and no call pins it. The strong handle is dropped after the
//!   lock is released.
//! - **No exports to dead peers**: once `release_all` has run for a peer, any
//!   further export to it fails with `SessionClosed`.
//! - **No awaits under the lock**: every method is synchronous.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::error::Error;
use crate::error::Result;
use crate::gc::Collector;
use crate::gc::GcStats;
use crate::handles::ObjectId;
use crate::handles::PeerId;
use crate::object::Object;
use crate::proxy::Proxy;

/// Something a peer can invoke through an `ObjectId`.
#[derive(Debug, Clone)]
pub enum Exported {
    /// A local capability set.
    Object(Object),
    /// A proxy into another session; calls are forwarded to its owner.
    Proxy(Proxy),
}

impl Exported {
    fn addr(&self) -> usize {
        match self {
            Exported::Object(o) => o.addr(),
            Exported::Proxy(p) => p.addr(),
        }
    }
}

enum Target {
    Shared(Exported),
    /// A root slot bound to a separate instance for each peer.
    PerPeer(HashMap<PeerId, Object>),
}

struct Entry {
    target: Target,
    peers: HashMap<PeerId, u64>,
    pins: u64,
    root: bool,
}

impl Entry {
    fn collectable(&self) -> bool {
        !self.root && self.pins == 0 && self.peers.is_empty()
    }

    fn target_for(&self, peer: PeerId) -> Option<Exported> {
        match &self.target {
            Target::Shared(target) => Some(target.clone()),
            Target::PerPeer(instances) => instances.get(&peer).cloned().map(Exported::Object),
        }
    }

    fn visible_to(&self, peer: PeerId) -> bool {
        self.root || self.peers.contains_key(&peer)
    }
}

#[derive(Default)]
struct Table {
    entries: HashMap<ObjectId, Entry>,
    by_addr: HashMap<usize, ObjectId>,
    /// Per-peer root instances by `(peer, address)`.
    instances: HashMap<(PeerId, usize), ObjectId>,
    live: HashSet<PeerId>,
    next_id: u64,
    next_peer: u64,
}

impl Table {
    fn insert(&mut self, target: Target, root: bool) -> ObjectId {
        let id = ObjectId(self.next_id);
        self.next_id += 1;
        self.entries.insert(id, Entry {
            target,
            peers: HashMap::new(),
            pins: 0,
            root,
        });
        id
    }

    fn remove(&mut self, id: ObjectId) -> Option<Exported> {
        let entry = self.entries.remove(&id)?;
        let Target::Shared(target) = entry.target else {
            return None;
        };
        if self.by_addr.get(&target.addr()) == Some(&id) {
            self.by_addr.remove(&target.addr());
        }
        Some(target)
    }

    fn lookup(&self, peer: PeerId, addr: usize) -> Option<ObjectId> {
        self.instances.get(&(peer, addr)).or_else(|| self.by_addr.get(&addr)).copied()
    }

    fn ensure_live(&self, peer: PeerId) -> Result<()> {
        if self.live.contains(&peer) { Ok(()) } else { Err(Error::SessionClosed) }
    }
}

/// The exported-object arena shared by every session of one server or client.
pub struct ExportTable {
    table: Mutex<Table>,
    collector: Collector,
}

impl Default for ExportTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ExportTable {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table::default()),
            collector: Collector::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a root. Roots are never reclaimed and may be addressed by any peer.
    ///
    /// Each call takes the next id, so root *i* is `ObjectId(i)` as long as
    /// roots are added before anything is exported.
    pub fn add_root(&self, object: Object) -> ObjectId {
        let mut table = self.lock();
        let addr = object.addr();
        let id = table.insert(Target::Shared(Exported::Object(object)), true);
        table.by_addr.entry(addr).or_insert(id);
        id
    }

    /// Registers a root whose object is supplied per peer with [`bind_root`](Self::bind_root).
    ///
    /// Until a peer's instance is bound, the id does not resolve for that peer.
    pub fn add_root_per_peer(&self) -> ObjectId {
        self.lock().insert(Target::PerPeer(HashMap::new()), true)
    }

    /// Binds `peer`'s own instance of a per-peer root and counts it as exported to `peer`.
    pub fn bind_root(&self, peer: PeerId, id: ObjectId, object: Object) -> Result<()> {
        let replaced = {
            let mut table = self.lock();
            table.ensure_live(peer)?;
            let addr = object.addr();
            let entry = table.entries.get_mut(&id).ok_or(Error::UnknownReference(id))?;
            let Target::PerPeer(instances) = &mut entry.target else {
                return Err(Error::UnknownReference(id));
            };
            let replaced = instances.insert(peer, object);
            *entry.peers.entry(peer).or_insert(0) += 1;
            if let Some(old) = &replaced {
                table.instances.remove(&(peer, old.addr()));
            }
            table.instances.insert((peer, addr), id);
            replaced
        };
        drop(replaced);
        Ok(())
    }

    /// Allocates an identity for a newly connected peer.
    pub fn next_peer(&self) -> PeerId {
        let mut table = self.lock();
        table.next_peer += 1;
        let peer = PeerId(table.next_peer);
        table.live.insert(peer);
        peer
    }

    /// Exports `target` to `peer`, returning its id and adding one to the peer's count.
    ///
    /// Fails with `SessionClosed` once the peer's counts have been dropped by
    /// [`release_all`](Self::release_all).
    pub fn export(&self, peer: PeerId, target: Exported) -> Result<ObjectId> {
        let mut table = self.lock();
        table.ensure_live(peer)?;
        let addr = target.addr();
        let id = match table.lookup(peer, addr) {
            Some(id) => id,
            None => {
                let id = table.insert(Target::Shared(target), false);
                table.by_addr.insert(addr, id);
                id
            }
        };
        if let Some(entry) = table.entries.get_mut(&id) {
            *entry.peers.entry(peer).or_insert(0) += 1;
        }
        Ok(id)
    }

    /// Subtracts `count` from `peer`'s count on `id`, reclaiming the entry if that was the last hold.
    pub fn release(&self, peer: PeerId, id: ObjectId, count: u64) -> Result<()> {
        let reclaimed = {
            let mut table = self.lock();
            let entry = table.entries.get_mut(&id).ok_or_else(|| {
                Error::Protocol(format!("{} released {} which it does not hold", peer, id))
            })?;
            let held = entry.peers.get(&peer).copied().unwrap_or(0);
            if count > held {
                return Err(Error::Protocol(format!(
                    "{} released {} x{} but holds {}", peer, id, count, held
                )));
            }
            if held == count {
                entry.peers.remove(&peer);
            } else {
                entry.peers.insert(peer, held - count);
            }
            if entry.collectable() { table.remove(id) } else { None }
        };
        if let Some(target) = reclaimed {
            self.collector.reclaim(id, target);
        }
        Ok(())
    }

    /// Drops every count `peer` holds, reclaiming whatever that frees, and
    /// retires the peer so nothing can be exported to it again.
    ///
    /// Returns how many entries the peer held.
    pub fn release_all(&self, peer: PeerId) -> usize {
        let (held, reclaimed, unbound) = {
            let mut table = self.lock();
            table.live.remove(&peer);
            table.instances.retain(|(owner, _), _| *owner != peer);
            let mut held = 0;
            let mut freed = Vec::new();
            let mut unbound = Vec::new();
            for (id, entry) in table.entries.iter_mut() {
                if let Target::PerPeer(instances) = &mut entry.target {
                    unbound.extend(instances.remove(&peer));
                }
                if entry.peers.remove(&peer).is_some() {
                    held += 1;
                    if entry.collectable() {
                        freed.push(*id);
                    }
                }
            }
            let reclaimed: Vec<(ObjectId, Exported)> = freed
                .into_iter()
                .filter_map(|id| table.remove(id).map(|t| (id, t)))
                .collect();
            (held, reclaimed, unbound)
        };
        for (id, target) in reclaimed {
            self.collector.reclaim(id, target);
        }
        if !unbound.is_empty() {
            tracing::debug!(%peer, roots = unbound.len(), "dropped per-peer roots");
        }
        drop(unbound);
        held
    }

    /// Looks `id` up on behalf of `peer`: only roots and ids exported to that peer resolve.
    pub fn resolve(&self, peer: PeerId, id: ObjectId) -> Option<Exported> {
        let table = self.lock();
        let entry = table.entries.get(&id)?;
        if !entry.visible_to(peer) {
            return None;
        }
        entry.target_for(peer)
    }

    /// Resolves and pins in one step, so the target cannot be reclaimed in between.
    pub fn acquire(self: &Arc<Self>, peer: PeerId, id: ObjectId) -> Option<(Exported, PinGuard)> {
        let mut table = self.lock();
        let entry = table.entries.get_mut(&id)?;
        if !entry.visible_to(peer) {
            return None;
        }
        let target = entry.target_for(peer)?;
        entry.pins += 1;
        Some((target, PinGuard { table: Arc::clone(self), id }))
    }

    /// Keeps `id` alive until the guard is dropped.
    pub fn pin(self: &Arc<Self>, id: ObjectId) -> Option<PinGuard> {
        let mut table = self.lock();
        let entry = table.entries.get_mut(&id)?;
        entry.pins += 1;
        Some(PinGuard { table: Arc::clone(self), id })
    }

    fn unpin(&self, id: ObjectId) {
        let reclaimed = {
            let mut table = self.lock();
            let Some(entry) = table.entries.get_mut(&id) else {
                return;
            };
            entry.pins = entry.pins.saturating_sub(1);
            if entry.collectable() { table.remove(id) } else { None }
        };
        if let Some(target) = reclaimed {
            self.collector.reclaim(id, target);
        }
    }

    /// `peer`'s count on `id`.
    pub fn count(&self, peer: PeerId, id: ObjectId) -> u64 {
        let table = self.lock();
        table.entries.get(&id).and_then(|e| e.peers.get(&peer).copied()).unwrap_or(0)
    }

    /// The aggregate count on `id` across all peers.
    pub fn total(&self, id: ObjectId) -> u64 {
        let table = self.lock();
        table.entries.get(&id).map(|e| e.peers.values().sum()).unwrap_or(0)
    }

    pub fn pins(&self, id: ObjectId) -> u64 {
        let table = self.lock();
        table.entries.get(&id).map(|e| e.pins).unwrap_or(0)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.lock().entries.contains_key(&id)
    }

    /// The id `object` is currently exported under, if any.
    pub fn id_of(&self, object: &Object) -> Option<ObjectId> {
        let table = self.lock();
        let addr = object.addr();
        table.by_addr.get(&addr).copied().or_else(|| {
            table.instances.iter().find(|((_, a), _)| *a == addr).map(|(_, id)| *id)
        })
    }

    /// Number of entries, roots included.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    pub fn stats(&self) -> GcStats {
        GcStats {
            reclaimed: self.collector.reclaimed(),
            live: self.len(),
        }
    }
}

/// Holds one pin on an exported object; unpins on drop.
pub struct PinGuard {
    table: Arc<ExportTable>,
    id: ObjectId,
}

impl PinGuard {
    pub fn id(&self) -> ObjectId {
        self.id
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.table.unpin(self.id);
    }
}

impl std::fmt::Debug for PinGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PinGuard({})", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn object(name: &str) -> Object {
        Object::builder(name).sync_method("ping", |_| Ok(Value::from("pong"))).build()
    }

    #[test]
    fn test_export_is_idempotent_per_peer() {
        let table = ExportTable::new();
        let p1 = table.next_peer();
        let p2 = table.next_peer();
        let obj = object("Thing");

        let a = table.export(p1, Exported::Object(obj.clone())).unwrap();
        let b = table.export(p1, Exported::Object(obj.clone())).unwrap();
        let c = table.export(p2, Exported::Object(obj.clone())).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(table.count(p1, a), 2);
        assert_eq!(table.count(p2, a), 1);
        assert_eq!(table.total(a), 3);
        assert_eq!(table.id_of(&obj), Some(a));
    }

    #[test]
    fn test_release_to_zero_reclaims() {
        let table = ExportTable::new();
        let peer = table.next_peer();
        let obj = object("Thing");
        let weak = obj.downgrade();

        let id = table.export(peer, Exported::Object(obj)).unwrap();
        table.export(peer, Exported::Object(weak.upgrade().unwrap())).unwrap();
        table.release(peer, id, 1).unwrap();
        assert!(table.contains(id));
        table.release(peer, id, 1).unwrap();
        assert!(!table.contains(id));
        assert!(!weak.is_alive());
        assert_eq!(table.stats().reclaimed, 1);
    }

    #[test]
    fn test_over_release_is_protocol_error() {
        let table = ExportTable::new();
        let peer = table.next_peer();
        let id = table.export(peer, Exported::Object(object("Thing"))).unwrap();

        assert!(matches!(table.release(peer, id, 2), Err(Error::Protocol(_))));
        assert_eq!(table.count(peer, id), 1);
        assert!(matches!(table.release(peer, ObjectId(99), 1), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_resolve_is_scoped_to_peer() {
        let table = ExportTable::new();
        let root = table.add_root(object("Root"));
        let p1 = table.next_peer();
        let p2 = table.next_peer();
        let id = table.export(p1, Exported::Object(object("Private"))).unwrap();

        assert!(table.resolve(p1, id).is_some());
        assert!(table.resolve(p2, id).is_none());
        assert!(table.resolve(p2, root).is_some());
        assert_eq!(root, ObjectId(0));
    }

    #[test]
    fn test_pin_delays_reclamation() {
        let table = Arc::new(ExportTable::new());
        let peer = table.next_peer();
        let id = table.export(peer, Exported::Object(object("Thing"))).unwrap();

        let (_, guard) = table.acquire(peer, id).expect("resolvable");
        table.release(peer, id, 1).unwrap();
        assert!(table.contains(id));
        assert_eq!(table.pins(id), 1);
        drop(guard);
        assert!(!table.contains(id));
    }

    #[test]
    fn test_release_all_spares_other_peers_and_roots() {
        let table = ExportTable::new();
        let root_obj = object("Root");
        let root = table.add_root(root_obj.clone());
        let p1 = table.next_peer();
        let p2 = table.next_peer();
        let shared_obj = object("Shared");
        let shared = table.export(p1, Exported::Object(shared_obj.clone())).unwrap();
        table.export(p2, Exported::Object(shared_obj)).unwrap();
        let only_p1 = table.export(p1, Exported::Object(object("Mine"))).unwrap();
        table.export(p1, Exported::Object(root_obj)).unwrap();

        assert_eq!(table.release_all(p1), 3);
        assert!(table.contains(root));
        assert!(table.contains(shared));
        assert!(!table.contains(only_p1));
        assert_eq!(table.count(p2, shared), 1);
        assert_eq!(table.count(p1, root), 0);
    }

    #[test]
    fn test_no_exports_after_release_all() {
        let table = ExportTable::new();
        let gone = table.next_peer();
        let other = table.next_peer();
        let obj = object("Late");
        let weak = obj.downgrade();

        table.release_all(gone);
        assert!(matches!(
            table.export(gone, Exported::Object(obj.clone())),
            Err(Error::SessionClosed)
        ));
        assert!(table.id_of(&obj).is_none());
        assert_eq!(table.len(), 0);

        let id = table.export(other, Exported::Object(obj)).unwrap();
        table.release(other, id, 1).unwrap();
        assert!(!weak.is_alive());
    }

    #[test]
    fn test_repeated_root_keeps_positions() {
        let table = ExportTable::new();
        let twice = object("Twice");
        let a = table.add_root(twice.clone());
        let b = table.add_root(twice.clone());
        let c = table.add_root(object("Third"));
        assert_eq!((a, b, c), (ObjectId(0), ObjectId(1), ObjectId(2)));

        let peer = table.next_peer();
        assert!(table.resolve(peer, c).is_some());
        assert_eq!(table.export(peer, Exported::Object(twice)).unwrap(), a);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_per_peer_roots_resolve_to_own_instance() {
        let table = ExportTable::new();
        let slot = table.add_root_per_peer();
        let p1 = table.next_peer();
        let p2 = table.next_peer();
        let first = object("Counter");
        let second = object("Counter");
        let weak = first.downgrade();

        assert!(table.resolve(p1, slot).is_none());
        table.bind_root(p1, slot, first.clone()).unwrap();
        table.bind_root(p2, slot, second.clone()).unwrap();

        let bound = |peer| match table.resolve(peer, slot) {
            Some(Exported::Object(object)) => object,
            other => panic!("expected a bound instance, got {:?}", other),
        };
        assert!(Object::ptr_eq(&bound(p1), &first));
        assert!(Object::ptr_eq(&bound(p2), &second));

        // Exporting the instance back to its own peer reuses the root id.
        assert_eq!(table.export(p1, Exported::Object(first.clone())).unwrap(), slot);
        // Anyone else gets an ordinary entry for it.
        let elsewhere = table.export(p2, Exported::Object(first.clone())).unwrap();
        assert_ne!(elsewhere, slot);
        table.release(p2, elsewhere, 1).unwrap();

        drop(first);
        table.release_all(p1);
        assert!(!weak.is_alive());
        assert!(table.resolve(p1, slot).is_none());
        assert!(table.resolve(p2, slot).is_some());
        assert!(table.contains(slot));
    }
}
