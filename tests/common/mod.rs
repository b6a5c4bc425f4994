#![allow(dead_code)] // not every test binary uses every helper

use std::sync::Arc;

use chrono::Utc;

use sshgate::config::BastionConfig;
use sshgate::context::AppContext;
use sshgate::crypto::SecretVault;
use sshgate::session::cache::DirectTcpCache;
use sshgate::session::registry::ConnectionRegistry;
use sshgate::store::models::{Acl, AclAction, Host, LoggingMode, User};
use sshgate::store::Store;

pub const TEST_AES_KEY: &str = "integration-test-key";

/// App context over an in-memory store, enough for driving the auth
/// engine and the chain builder without a listener.
pub fn test_context() -> Arc<AppContext> {
    let mut config = BastionConfig::default();
    config.security.aes_key = TEST_AES_KEY.to_string();
    Arc::new(AppContext {
        config: Arc::new(config),
        store: Arc::new(Store::in_memory()),
        vault: Arc::new(SecretVault::new(TEST_AES_KEY)),
        cache: Arc::new(DirectTcpCache::new()),
        registry: Arc::new(ConnectionRegistry::new()),
    })
}

/// A user placed in one fresh group, returned along with the group id.
pub async fn enrolled_user(ctx: &AppContext, name: &str) -> (User, u64) {
    let group = ctx.store.create_group(&format!("{name}-group")).await;
    let user = ctx
        .store
        .create_user(name, &format!("{name}@example.com"), "")
        .await;
    ctx.store.add_user_to_group(user.id, group.id).await.unwrap();
    let user = ctx.store.user_by_id(user.id).await.unwrap();
    (user, group.id)
}

/// A password-credentialed SSH host placed in one fresh group.
pub async fn ssh_host(ctx: &AppContext, name: &str, hop_id: Option<u64>) -> (Host, u64) {
    let group = ctx.store.create_group(&format!("{name}-group")).await;
    let host = ctx
        .store
        .create_host(Host {
            id: 0,
            name: name.to_string(),
            addr: format!("{name}.internal:22"),
            username: "root".to_string(),
            scheme: "ssh".to_string(),
            password: Some(ctx.vault.seal("hunter2").unwrap()),
            ssh_key_id: None,
            hop_id,
            logging: LoggingMode::Everything,
            host_key: Vec::new(),
            group_ids: Vec::new(),
            created_at: Utc::now(),
        })
        .await;
    ctx.store.add_host_to_group(host.id, group.id).await.unwrap();
    let host = ctx.store.host_by_id(host.id).await.unwrap();
    (host, group.id)
}

/// Allow rule connecting one user group to one host group.
pub async fn allow_rule(ctx: &AppContext, user_group: u64, host_group: u64) {
    ctx.store
        .create_acl(Acl {
            id: 0,
            action: AclAction::Allow,
            weight: 10,
            host_pattern: String::new(),
            user_group_ids: vec![user_group],
            host_group_ids: vec![host_group],
            comment: String::new(),
        })
        .await;
}

/// Deny rule connecting one user group to one host group.
pub async fn deny_rule(ctx: &AppContext, user_group: u64, host_group: u64) {
    ctx.store
        .create_acl(Acl {
            id: 0,
            action: AclAction::Deny,
            weight: 10,
            host_pattern: String::new(),
            user_group_ids: vec![user_group],
            host_group_ids: vec![host_group],
            comment: String::new(),
        })
        .await;
}
