use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::session::SessionConfig;
use crate::store::models::Id;

/// Idle window after which a cached chain is swept, and the sweep period.
pub const DIRECT_TCP_KEEPALIVE: Duration = Duration::from_secs(120);

/// A resolved hop chain kept alive between direct-tcpip opens of one
/// client, so repeated port-forwards skip the chain resolution, ACL
/// evaluation and upstream dial.
#[derive(Clone)]
pub struct DirectTcpEntry {
    pub user_id: Id,
    pub chain: Vec<SessionConfig>,
    pub last_used: Instant,
}

/// Cache of direct-tcpip chains keyed by client fingerprint.
///
/// One exclusive lock covers reads and writes; readers touch `last_used`
/// under it, so sweeping cannot race a reader.
#[derive(Default)]
pub struct DirectTcpCache {
    entries: Mutex<HashMap<String, DirectTcpEntry>>,
}

impl DirectTcpCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an entry and refresh its idle stamp.
    pub fn get_and_touch(&self, fingerprint: &str) -> Option<DirectTcpEntry> {
        let mut entries = self.entries.lock().expect("direct-tcp cache poisoned");
        let entry = entries.get_mut(fingerprint)?;
        entry.last_used = Instant::now();
        Some(entry.clone())
    }

    pub fn put(&self, fingerprint: String, entry: DirectTcpEntry) {
        let mut entries = self.entries.lock().expect("direct-tcp cache poisoned");
        entries.insert(fingerprint, entry);
    }

    /// Remove entries idle for at least the keepalive window. Expiry only
    /// blocks reuse; it never touches live channels.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock().expect("direct-tcp cache poisoned");
        let before = entries.len();
        entries.retain(|_, e| now.duration_since(e.last_used) < DIRECT_TCP_KEEPALIVE);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("direct-tcp cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Background sweeper, one tick per keepalive window.
pub fn spawn_sweeper(cache: Arc<DirectTcpCache>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(DIRECT_TCP_KEEPALIVE).await;
            let evicted = cache.sweep(Instant::now());
            if evicted > 0 {
                debug!(evicted, "Swept idle direct-tcpip chains");
            }
        }
    })
}

/// Deterministic fingerprint of one client identity, quoting each part so
/// delimiters inside values cannot collide.
pub fn direct_tcp_fingerprint(
    ssh_user: &str,
    remote: &SocketAddr,
    local: &str,
    user_id: Id,
    email: &str,
) -> String {
    format!(
        "{:?}/{:?}/{:?}/{:?}/{:?}/",
        ssh_user,
        remote.to_string(),
        local,
        user_id,
        email
    )
}
