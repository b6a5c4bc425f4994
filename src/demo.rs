//! Throwaway data set for demo mode: one admin invite, one target host
//! behind a hop, and an allow-everything rule.

use anyhow::Result;
use chrono::Utc;
use tracing::info;

use crate::crypto::SecretVault;
use crate::store::models::{Acl, AclAction, Host, LoggingMode};
use crate::store::Store;

pub const DEMO_INVITE_TOKEN: &str = "demo";

pub async fn seed(store: &Store, vault: &SecretVault) -> Result<()> {
    if !store.users().await.is_empty() {
        return Ok(());
    }

    let users = store.create_group("demo-users").await;
    let hosts = store.create_group("demo-hosts").await;

    let admin = store
        .create_user("admin", "admin@example.com", DEMO_INVITE_TOKEN)
        .await;
    store.add_user_to_group(admin.id, users.id).await?;

    let hop = store
        .create_host(Host {
            id: 0,
            name: "hop01".to_string(),
            addr: "127.0.0.1:22".to_string(),
            username: "root".to_string(),
            scheme: "ssh".to_string(),
            password: Some(vault.seal("root")?),
            ssh_key_id: None,
            hop_id: None,
            logging: LoggingMode::Everything,
            host_key: Vec::new(),
            group_ids: Vec::new(),
            created_at: Utc::now(),
        })
        .await;
    store.add_host_to_group(hop.id, hosts.id).await?;

    let target = store
        .create_host(Host {
            id: 0,
            name: "demo".to_string(),
            addr: "127.0.0.1:22".to_string(),
            username: "root".to_string(),
            scheme: "ssh".to_string(),
            password: Some(vault.seal("root")?),
            ssh_key_id: None,
            hop_id: Some(hop.id),
            logging: LoggingMode::Everything,
            host_key: Vec::new(),
            group_ids: Vec::new(),
            created_at: Utc::now(),
        })
        .await;
    store.add_host_to_group(target.id, hosts.id).await?;

    store
        .create_acl(Acl {
            id: 0,
            action: AclAction::Allow,
            weight: 10,
            host_pattern: String::new(),
            user_group_ids: vec![users.id],
            host_group_ids: vec![hosts.id],
            comment: "demo default".to_string(),
        })
        .await;

    info!(
        invite = DEMO_INVITE_TOKEN,
        "Demo data seeded — enroll with: ssh invite:{}@<bastion>", DEMO_INVITE_TOKEN
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seed_is_idempotent() {
        let store = Store::in_memory();
        let vault = SecretVault::new("demo");
        seed(&store, &vault).await.unwrap();
        seed(&store, &vault).await.unwrap();
        assert_eq!(store.users().await.len(), 1);
        assert_eq!(store.hosts().await.len(), 2);
        assert!(store.user_by_invite_token(DEMO_INVITE_TOKEN).await.is_some());
    }
}
