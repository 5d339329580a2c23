//! L3 transparent-socket cache (spec.md §4.3): a bounded LRU of
//! `IPV6_TRANSPARENT`-bound UDP reply sockets, keyed by peer address, so
//! the UDP session path can answer from the exact original destination
//! without rebinding a fresh socket per datagram.
//!
//! Grounded on `original_source/src/hev-tsocks-cache.c`. The C version
//! holds a global rwlock in read mode across `hev_tsocks_cache_get`'s
//! return and only releases it in the matching `hev_tsocks_cache_put`;
//! here that invariant becomes an RAII [`TsockLease`] whose `Drop`
//! releases the read guard, so a caller cannot forget the "put" half.
//! The C side's separate LRU spinlock becomes its own `Mutex` guarding
//! just the recency order, mirroring the original's rwlock/spinlock
//! duality instead of collapsing it into one lock.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{Mutex, OwnedRwLockReadGuard, RwLock};

use crate::socket::factory;

/// Cap on live cached sockets (`original_source/src/hev-config-const.h`,
/// `TSOCKS_MAX_CACHED`).
const MAX_CACHED: usize = 64;

struct Entry {
    socket: UdpSocket,
}

type Entries = HashMap<SocketAddr, Arc<Entry>>;

pub struct TsockCache {
    entries: Arc<RwLock<Entries>>,
    order: Mutex<VecDeque<SocketAddr>>,
}

impl TsockCache {
    pub fn new() -> Self {
        TsockCache {
            entries: Arc::new(RwLock::new(HashMap::new())),
            order: Mutex::new(VecDeque::new()),
        }
    }

    /// Borrow (creating if necessary) the reply socket bound to
    /// `peer_addr`. The returned lease holds the cache's read lock until
    /// dropped, matching spec.md §4.3's "checked out until the caller
    /// is done replying" lifetime.
    pub async fn get(&self, peer_addr: SocketAddr) -> std::io::Result<TsockLease> {
        loop {
            let guard = self.entries.clone().read_owned().await;
            if let Some(entry) = guard.get(&peer_addr) {
                let entry = entry.clone();
                self.touch(peer_addr).await;
                return Ok(TsockLease {
                    _guard: guard,
                    entry,
                });
            }
            drop(guard);

            self.make_room().await;
            self.insert(peer_addr).await?;
            // loop back around and pick the freshly inserted entry up
            // under a read lock, same retry shape as the original.
        }
    }

    async fn touch(&self, addr: SocketAddr) {
        let mut order = self.order.lock().await;
        if let Some(pos) = order.iter().position(|a| *a == addr) {
            order.remove(pos);
        }
        order.push_back(addr);
    }

    async fn make_room(&self) {
        let should_evict = self.entries.read().await.len() >= MAX_CACHED;
        if !should_evict {
            return;
        }
        let oldest = {
            let mut order = self.order.lock().await;
            order.pop_front()
        };
        if let Some(addr) = oldest {
            let mut entries = self.entries.write().await;
            // re-check: another racing get() may have already evicted or
            // re-touched this address between the length check and here.
            if entries.len() >= MAX_CACHED {
                entries.remove(&addr);
            }
        }
    }

    async fn insert(&self, addr: SocketAddr) -> std::io::Result<()> {
        let std_socket = factory::bind_transparent_reply_socket(addr)?;
        std_socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_socket.into())?;

        let mut entries = self.entries.write().await;
        if entries.contains_key(&addr) {
            // lost the race to another task creating the same entry;
            // keep theirs, drop ours.
            return Ok(());
        }
        entries.insert(addr, Arc::new(Entry { socket }));
        drop(entries);

        self.order.lock().await.push_back(addr);
        Ok(())
    }
}

impl Default for TsockCache {
    fn default() -> Self {
        Self::new()
    }
}

/// A borrowed transparent reply socket. Held across the UDP reply send,
/// then dropped to release the cache's read lock (spec.md §4.3 "put").
pub struct TsockLease {
    _guard: OwnedRwLockReadGuard<Entries>,
    entry: Arc<Entry>,
}

impl TsockLease {
    pub fn socket(&self) -> &UdpSocket {
        &self.entry.socket
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reuses_the_same_socket_for_a_repeat_peer() {
        let cache = TsockCache::new();
        let peer: SocketAddr = "[::1]:9001".parse().unwrap();

        let first_local = {
            let lease = cache.get(peer).await;
            match lease {
                Ok(l) => Some(l.socket().local_addr().unwrap()),
                Err(_) => None, // IPV6_TRANSPARENT unavailable in test sandbox
            }
        };
        let Some(first_local) = first_local else {
            return;
        };

        let lease2 = cache.get(peer).await.unwrap();
        assert_eq!(lease2.socket().local_addr().unwrap(), first_local);
    }
}
