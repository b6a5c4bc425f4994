use anyhow::{Context, Result};
use rand::rngs::OsRng;
use russh::keys::{decode_secret_key, encode_pkcs8_pem, Algorithm, PrivateKey};

use crate::crypto::SecretVault;
use crate::store::Store;

/// Name of the stored key record that backs the listener's host key.
const HOST_KEY_NAME: &str = "host";

/// The bastion's own SSH host key lives in the store, sealed like any
/// other secret. First boot generates an Ed25519 key and records it.
pub async fn load_or_create_host_key(store: &Store, vault: &SecretVault) -> Result<PrivateKey> {
    if let Some(record) = store.ssh_key_by_name(HOST_KEY_NAME).await {
        let pem = vault
            .open(&record.priv_key)
            .context("unsealing host key (wrong AES key?)")?;
        let key = decode_secret_key(&pem, None)
            .map_err(|e| anyhow::anyhow!("decoding host key: {e}"))?;
        return Ok(key);
    }

    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|e| anyhow::anyhow!("Ed25519 key generation failed: {e}"))?;

    let mut buf = Vec::new();
    encode_pkcs8_pem(&key, &mut buf).map_err(|e| anyhow::anyhow!("encoding host key: {e}"))?;
    let pem = String::from_utf8(buf).context("host key PEM is not utf-8")?;
    let pub_key = key
        .public_key()
        .to_openssh()
        .map_err(|e| anyhow::anyhow!("encoding host public key: {e}"))?;

    let sealed = vault.seal(&pem)?;
    store.create_ssh_key(HOST_KEY_NAME, sealed, &pub_key).await;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generates_then_reloads_same_key() {
        let store = Store::in_memory();
        let vault = SecretVault::new("test material");

        let first = load_or_create_host_key(&store, &vault).await.unwrap();
        let second = load_or_create_host_key(&store, &vault).await.unwrap();
        assert_eq!(
            first.public_key().to_openssh().unwrap(),
            second.public_key().to_openssh().unwrap()
        );
        assert!(store.ssh_key_by_name("host").await.is_some());
    }

    #[tokio::test]
    async fn wrong_vault_key_is_fatal() {
        let store = Store::in_memory();
        load_or_create_host_key(&store, &SecretVault::new("right"))
            .await
            .unwrap();
        let result = load_or_create_host_key(&store, &SecretVault::new("wrong")).await;
        assert!(result.is_err());
    }
}
