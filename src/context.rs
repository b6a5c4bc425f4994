use std::sync::Arc;

use crate::config::BastionConfig;
use crate::crypto::SecretVault;
use crate::session::cache::DirectTcpCache;
use crate::session::registry::ConnectionRegistry;
use crate::store::Store;

/// Shared application context handed to every connection handler.
pub struct AppContext {
    pub config: Arc<BastionConfig>,
    pub store: Arc<Store>,
    pub vault: Arc<SecretVault>,
    pub cache: Arc<DirectTcpCache>,
    pub registry: Arc<ConnectionRegistry>,
}
