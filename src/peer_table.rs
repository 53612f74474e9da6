//! Endpoint-keyed peer storage with an arena-indexed traversal order.
//!
//! The original design used an intrusive next-pointer embedded in each peer record so the hot
//! iteration paths (logic tick, broadcast) could walk peers without allocating a collection. Here
//! the peer record is an `Arc<dyn PeerStateMachine>` with no room for an embedded link, so the
//! next-pointer lives in an arena slot instead, addressed by a stable `usize` index — the
//! generalization the design notes call for.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use crate::peer::Peer;

struct Slot {
    peer: Peer,
    next: Option<usize>,
}

struct Inner {
    slots: Vec<Option<Slot>>,
    by_endpoint: HashMap<SocketAddr, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl Inner {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            by_endpoint: HashMap::new(),
            head: None,
            tail: None,
        }
    }

    fn push(&mut self, peer: Peer) -> usize {
        let index = self.slots.len();
        self.slots.push(Some(Slot { peer, next: None }));
        if let Some(tail) = self.tail {
            self.slots[tail].as_mut().expect("tail slot present").next = Some(index);
        } else {
            self.head = Some(index);
        }
        self.tail = Some(index);
        index
    }

    fn unlink(&mut self, index: usize) {
        let mut prev = None;
        let mut cursor = self.head;
        while let Some(i) = cursor {
            let next = self.slots[i].as_ref().and_then(|s| s.next);
            if i == index {
                match prev {
                    Some(p) => self.slots[p].as_mut().expect("prev present").next = next,
                    None => self.head = next,
                }
                if self.tail == Some(index) {
                    self.tail = prev;
                }
                break;
            }
            prev = Some(i);
            cursor = next;
        }
        self.slots[index] = None;
    }

    fn snapshot(&self) -> Vec<Peer> {
        let mut out = Vec::new();
        let mut cursor = self.head;
        while let Some(i) = cursor {
            if let Some(slot) = &self.slots[i] {
                out.push(slot.peer.clone());
                cursor = slot.next;
            } else {
                break;
            }
        }
        out
    }
}

/// The table of peers currently known to a `NetManager`, keyed by remote endpoint.
///
/// Internally synchronized: safe to call from the socket-receive thread, the logic-tick thread,
/// and user threads concurrently. Iteration returns a point-in-time snapshot rather than a live
/// cursor, so a concurrent `remove_peer` never invalidates an in-progress walk.
pub struct PeerTable {
    inner: Mutex<Inner>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
        }
    }

    /// Look up the peer at `endpoint`, if one is resident.
    pub fn try_get(&self, endpoint: SocketAddr) -> Option<Peer> {
        let inner = self.inner.lock().expect("peer table poisoned");
        inner
            .by_endpoint
            .get(&endpoint)
            .and_then(|&i| inner.slots[i].as_ref())
            .map(|slot| slot.peer.clone())
    }

    /// Insert `peer` if its endpoint is not already occupied.
    ///
    /// Returns the peer actually resident at that endpoint: `peer` itself on a fresh insert, or
    /// the pre-existing occupant if another thread won the race.
    pub fn try_add(&self, peer: Peer) -> Peer {
        let endpoint = peer.endpoint();
        let mut inner = self.inner.lock().expect("peer table poisoned");
        if let Some(&index) = inner.by_endpoint.get(&endpoint) {
            if let Some(slot) = &inner.slots[index] {
                return slot.peer.clone();
            }
        }
        let index = inner.push(peer.clone());
        inner.by_endpoint.insert(endpoint, index);
        peer
    }

    /// Remove a peer by endpoint identity. A no-op if the peer is not the current occupant of its
    /// endpoint (e.g. it was already replaced).
    pub fn remove_peer(&self, peer: &Peer) {
        let endpoint = peer.endpoint();
        let mut inner = self.inner.lock().expect("peer table poisoned");
        if let Some(index) = inner.by_endpoint.remove(&endpoint) {
            inner.unlink(index);
        }
    }

    pub fn remove_peers(&self, peers: &[Peer]) {
        for peer in peers {
            self.remove_peer(peer);
        }
    }

    /// Drop every peer record.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("peer table poisoned");
        *inner = Inner::new();
    }

    /// A point-in-time snapshot of resident peers, in insertion order minus removals.
    pub fn snapshot(&self) -> Vec<Peer> {
        self.inner.lock().expect("peer table poisoned").snapshot()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("peer table poisoned").by_endpoint.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}
