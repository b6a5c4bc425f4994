use std::sync::Arc;

use russh::client;
use russh::keys::{PublicKey, PublicKeyBase64};
use tracing::info;

use crate::store::models::Id;
use crate::store::Store;

/// Trust-on-first-use verifier for one upstream hop.
///
/// The first successful dial records the marshaled server key into the
/// host row; every later dial byte-compares against it. A mismatch aborts
/// the dial with `host key mismatch`.
pub struct HopVerifier {
    store: Arc<Store>,
    host_id: Id,
    host_name: String,
}

impl HopVerifier {
    pub fn new(store: Arc<Store>, host_id: Id, host_name: String) -> Self {
        Self {
            store,
            host_id,
            host_name,
        }
    }
}

impl client::Handler for HopVerifier {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let marshaled = server_public_key.public_key_base64().into_bytes();
        let host = self
            .store
            .host_by_id(self.host_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("host {} disappeared mid-dial", self.host_name))?;

        if host.host_key.is_empty() {
            info!(host = %self.host_name, "Recording host fingerprint on first contact");
            self.store.record_host_key(self.host_id, marshaled).await?;
            return Ok(true);
        }

        if host.host_key != marshaled {
            anyhow::bail!("host key mismatch for {}", self.host_name);
        }
        Ok(true)
    }
}
