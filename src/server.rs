use std::sync::Arc;

use anyhow::{Context, Result};
use russh::server::Server as _;
use tracing::info;

use crate::config::BastionConfig;
use crate::context::AppContext;
use crate::crypto::SecretVault;
use crate::demo;
use crate::session::cache::{self, DirectTcpCache};
use crate::session::registry::ConnectionRegistry;
use crate::ssh::handler::SshHandler;
use crate::ssh::keys;
use crate::store::Store;

/// Wire the store, vault, cache and registry together and serve SSH on
/// the configured listener.
pub async fn run(config: BastionConfig) -> Result<()> {
    let config = Arc::new(config);

    let store = Arc::new(match config.store.driver.as_str() {
        "memory" => Store::in_memory(),
        _ => Store::open(&config.store.url)?,
    });

    let aes_key = if config.security.aes_key.is_empty() && config.server.demo {
        "sshgate-demo".to_string()
    } else {
        config.security.aes_key.clone()
    };
    let vault = Arc::new(SecretVault::new(&aes_key));

    if config.server.demo {
        demo::seed(&store, &vault).await?;
    }

    let host_key = keys::load_or_create_host_key(&store, &vault)
        .await
        .context("loading bastion host key")?;
    info!("Host key loaded");

    let cache = Arc::new(DirectTcpCache::new());
    cache::spawn_sweeper(cache.clone());

    let ctx = Arc::new(AppContext {
        config: config.clone(),
        store,
        vault,
        cache,
        registry: Arc::new(ConnectionRegistry::new()),
    });

    let mut ssh_config = russh::server::Config::default();
    ssh_config.keys.push(host_key);
    ssh_config.server_id = russh::SshId::Standard(format!(
        "SSH-2.0-sshgate_{}",
        env!("CARGO_PKG_VERSION")
    ));
    ssh_config.auth_rejection_time = std::time::Duration::from_secs(1);
    ssh_config.auth_rejection_time_initial = Some(std::time::Duration::from_secs(0));
    let ssh_config = Arc::new(ssh_config);

    info!(addr = %config.server.bind_addr, "SSH bastion listening");

    let mut server = BastionServer { ctx };
    server
        .run_on_address(ssh_config, config.server.bind_addr.as_str())
        .await
        .context("ssh listener failed")?;
    Ok(())
}

struct BastionServer {
    ctx: Arc<AppContext>,
}

impl russh::server::Server for BastionServer {
    type Handler = SshHandler;

    fn new_client(&mut self, peer_addr: Option<std::net::SocketAddr>) -> SshHandler {
        let peer = peer_addr
            .unwrap_or_else(|| "0.0.0.0:0".parse().expect("valid fallback address literal"));
        let handler = SshHandler::new(self.ctx.clone(), peer);
        info!(peer = %peer, conn_id = handler.conn_id(), "New SSH connection");
        handler
    }
}
