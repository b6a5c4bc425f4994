// Direct-tcpip chain cache: reuse within the keepalive window, eviction
// at the sweep tick, and fingerprint stability across identical opens.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use sshgate::session::cache::{
    direct_tcp_fingerprint, DirectTcpCache, DirectTcpEntry, DIRECT_TCP_KEEPALIVE,
};
use sshgate::session::{HopAuth, SessionConfig};
use sshgate::store::models::LoggingMode;

fn chain_entry(user_id: u64) -> DirectTcpEntry {
    DirectTcpEntry {
        user_id,
        chain: vec![SessionConfig {
            host_id: 1,
            host_name: "web01".to_string(),
            addr: "web01.internal:22".to_string(),
            username: "root".to_string(),
            auth: HopAuth::Password("hunter2".to_string()),
            logging: LoggingMode::Everything,
        }],
        last_used: Instant::now(),
    }
}

#[test]
fn identical_opens_share_one_fingerprint() {
    let remote: SocketAddr = "192.0.2.7:49152".parse().unwrap();
    let first = direct_tcp_fingerprint("web01", &remote, "0.0.0.0:2222", 3, "alice@example.com");
    let second = direct_tcp_fingerprint("web01", &remote, "0.0.0.0:2222", 3, "alice@example.com");
    assert_eq!(first, second);

    // A different client port means a different connection, and a
    // different slot.
    let other_remote: SocketAddr = "192.0.2.7:49153".parse().unwrap();
    let third =
        direct_tcp_fingerprint("web01", &other_remote, "0.0.0.0:2222", 3, "alice@example.com");
    assert_ne!(first, third);
}

#[test]
fn second_open_within_window_reuses_the_chain() {
    let cache = DirectTcpCache::new();
    let remote: SocketAddr = "192.0.2.7:49152".parse().unwrap();
    let fp = direct_tcp_fingerprint("web01", &remote, "0.0.0.0:2222", 3, "alice@example.com");

    assert!(cache.get_and_touch(&fp).is_none());
    cache.put(fp.clone(), chain_entry(3));

    let hit = cache.get_and_touch(&fp).expect("entry cached");
    assert_eq!(hit.user_id, 3);
    assert_eq!(hit.chain.len(), 1);
    assert_eq!(hit.chain[0].host_name, "web01");
}

#[test]
fn idle_entries_are_gone_after_the_tick() {
    let cache = DirectTcpCache::new();
    let mut entry = chain_entry(3);
    entry.last_used = Instant::now() - DIRECT_TCP_KEEPALIVE - Duration::from_millis(1);
    cache.put("stale".to_string(), entry);
    cache.put("fresh".to_string(), chain_entry(4));

    assert_eq!(cache.sweep(Instant::now()), 1);
    assert!(cache.get_and_touch("stale").is_none());
    assert!(cache.get_and_touch("fresh").is_some());

    // A second tick with nothing idle removes nothing.
    assert_eq!(cache.sweep(Instant::now()), 0);
}

#[test]
fn touch_keeps_an_entry_alive_across_ticks() {
    let cache = DirectTcpCache::new();
    let mut entry = chain_entry(3);
    entry.last_used = Instant::now() - DIRECT_TCP_KEEPALIVE + Duration::from_secs(1);
    cache.put("busy".to_string(), entry);

    // Client opens another channel just before expiry.
    cache.get_and_touch("busy").unwrap();

    assert_eq!(cache.sweep(Instant::now()), 0);
    assert!(cache.get_and_touch("busy").is_some());
}
