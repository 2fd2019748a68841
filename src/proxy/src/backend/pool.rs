//! Per-worker cache of idle, authenticated backend channels.
//!
//! Each worker thread owns exactly one `ConnectionPool`. Pool entries are
//! never shared across workers: there is deliberately no `Arc`/`Mutex`
//! wrapping one shared structure across threads here, unlike the registry
//! which is read from every worker.

use crate::backend::channel::{BackendChannel, ChannelState};
use crate::backend::registry::Server;
use lru::LruCache;
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Bounded idle capacity per server. 0 disables pooling.
    pub capacity: usize,
    pub idle_timeout: Duration,
    pub waitlist_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 0,
            idle_timeout: Duration::from_secs(60 * 60),
            waitlist_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool exhausted waiting for a connection to {0}")]
    Timeout(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

struct Idle {
    channel: BackendChannel,
    parked_at: Instant,
}

struct PerServerPool {
    idle: LruCache<usize, Idle>,
    next_slot: usize,
    open_count: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

impl PerServerPool {
    fn new(capacity: usize) -> Self {
        Self {
            idle: LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap()),
            next_slot: 0,
            open_count: 0,
            waiters: VecDeque::new(),
        }
    }
}

/// Owns idle channels for every server this worker has touched. `acquire`
/// either hands back a pooled channel, opens a fresh one under the global
/// cap, or waits in the per-server waitlist.
pub struct ConnectionPool {
    config: PoolConfig,
    global_cap: usize,
    per_server: HashMap<String, PerServerPool>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, global_cap: usize) -> Self {
        Self {
            config,
            global_cap,
            per_server: HashMap::new(),
        }
    }

    fn slot_for(&mut self, server: &str) -> &mut PerServerPool {
        self.per_server
            .entry(server.to_string())
            .or_insert_with(|| PerServerPool::new(self.config.capacity.max(1)))
    }

    /// Acquires a channel to `server`, pooled if available, freshly opened
    /// if under cap, or after waiting for one to free up.
    pub async fn acquire(&mut self, server: &Arc<Server>) -> Result<BackendChannel, PoolError> {
        loop {
            if self.config.capacity > 0 {
                let slot = self.slot_for(&server.name);
                while let Some((_, idle)) = slot.idle.pop_lru() {
                    if idle.channel.state() != ChannelState::Pooled {
                        debug!(server = %server.name, "discarding a pooled channel that hung up");
                        slot.open_count = slot.open_count.saturating_sub(1);
                        continue;
                    }
                    let mut channel = idle.channel;
                    channel.set_state(ChannelState::Idle);
                    return Ok(channel);
                }
            }

            let open_count = self.per_server.get(&server.name).map(|p| p.open_count).unwrap_or(0);
            if open_count < self.global_cap {
                let channel = BackendChannel::connect(Arc::clone(server)).await?;
                self.slot_for(&server.name).open_count += 1;
                return Ok(channel);
            }

            let (tx, rx) = oneshot::channel();
            self.slot_for(&server.name).waiters.push_back(tx);
            match timeout(self.config.waitlist_timeout, rx).await {
                Ok(_) => continue,
                Err(_) => return Err(PoolError::Timeout(server.name.clone())),
            }
        }
    }

    /// Returns a channel to the pool if it ended its use in a known-good
    /// state, otherwise closes it outright.
    pub async fn release(&mut self, mut channel: BackendChannel) {
        let server_name = channel.server.name.clone();
        if self.config.capacity > 0 && channel.is_reusable() {
            channel.set_state(ChannelState::Pooled);
            let slot = self.slot_for(&server_name);
            let next = slot.next_slot;
            slot.next_slot += 1;
            slot.idle.put(next, Idle { channel, parked_at: Instant::now() });
            if let Some(waiter) = slot.waiters.pop_front() {
                let _ = waiter.send(());
            }
            return;
        }
        if let Err(e) = channel.shutdown().await {
            warn!(server = %server_name, error = %e, "error closing a non-reusable backend channel");
        }
        if let Some(slot) = self.per_server.get_mut(&server_name) {
            slot.open_count = slot.open_count.saturating_sub(1);
            if let Some(waiter) = slot.waiters.pop_front() {
                let _ = waiter.send(());
            }
        }
    }

    /// Evicts idle channels parked longer than `idle_timeout`. Call once per
    /// reactor tick.
    pub async fn evict_idle(&mut self) {
        let now = Instant::now();
        for slot in self.per_server.values_mut() {
            let mut still_idle = Vec::new();
            while let Some((key, idle)) = slot.idle.pop_lru() {
                if now.duration_since(idle.parked_at) >= self.config.idle_timeout {
                    let mut channel = idle.channel;
                    let _ = channel.shutdown().await;
                    slot.open_count = slot.open_count.saturating_sub(1);
                } else {
                    still_idle.push((key, idle));
                }
            }
            for (key, idle) in still_idle {
                slot.idle.put(key, idle);
            }
        }
    }

    pub fn currently_open(&self, server: &str) -> usize {
        self.per_server.get(server).map(|p| p.open_count).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_disables_pooling() {
        let config = PoolConfig::default();
        assert_eq!(config.capacity, 0);
    }

    #[test]
    fn per_server_pool_starts_empty() {
        let mut pool = ConnectionPool::new(PoolConfig { capacity: 4, ..PoolConfig::default() }, 10);
        assert_eq!(pool.currently_open("m"), 0);
    }
}
