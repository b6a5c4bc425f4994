use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Primary key type shared by all store entities.
pub type Id = u64;

/// Comment value marking a user account as disabled.
pub const USER_DISABLED: &str = "disabled";

/// A policy user. Group membership carries the ACL relationships.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Id,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub comment: String,
    /// Single-use enrollment token; empty when none is outstanding.
    #[serde(default)]
    pub invite_token: String,
    #[serde(default)]
    pub group_ids: Vec<Id>,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Sentinel for connections whose key resolved to no user.
    pub fn anonymous() -> Self {
        Self {
            id: 0,
            name: "Anonymous".to_string(),
            email: String::new(),
            comment: String::new(),
            invite_token: String::new(),
            group_ids: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.comment == USER_DISABLED
    }
}

/// A public key bound to a user, in OpenSSH authorized-key text form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserKey {
    pub id: Id,
    pub user_id: Id,
    pub authorized_key: String,
    #[serde(default)]
    pub comment: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: Id,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AclAction {
    Allow,
    Deny,
}

/// An access rule attached to user groups and host groups.
///
/// Applicable rules are ordered by ascending weight; the first action wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Acl {
    pub id: Id,
    pub action: AclAction,
    pub weight: u64,
    /// Optional glob over host names ('*' wildcard); empty disables it.
    #[serde(default)]
    pub host_pattern: String,
    #[serde(default)]
    pub user_group_ids: Vec<Id>,
    #[serde(default)]
    pub host_group_ids: Vec<Id>,
    #[serde(default)]
    pub comment: String,
}

/// Per-hop transcript recording level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingMode {
    Disabled,
    /// Record only what the client sends.
    Input,
    #[default]
    Everything,
}

/// A registered target host, optionally reached through a hop chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: Id,
    pub name: String,
    /// Dial address, `host:port`.
    pub addr: String,
    /// Login name on the target.
    pub username: String,
    /// Transport scheme: `ssh` or `telnet`.
    pub scheme: String,
    /// Login password, sealed with the process AES key.
    #[serde(default)]
    pub password: Option<Vec<u8>>,
    /// Private key record to authenticate with, alternative to `password`.
    #[serde(default)]
    pub ssh_key_id: Option<Id>,
    /// Predecessor host in the chain; the walk must terminate at a host
    /// with no hop.
    #[serde(default)]
    pub hop_id: Option<Id>,
    #[serde(default)]
    pub logging: LoggingMode,
    /// Marshaled public key recorded on first contact; empty until then.
    #[serde(default)]
    pub host_key: Vec<u8>,
    #[serde(default)]
    pub group_ids: Vec<Id>,
    pub created_at: DateTime<Utc>,
}

/// A private key owned by the bastion itself. The record named `host`
/// is the listener's SSH host key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshKey {
    pub id: Id,
    pub name: String,
    /// PEM private key, sealed with the process AES key.
    pub priv_key: Vec<u8>,
    pub pub_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Closed,
}

/// Persisted record of one proxied connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Id,
    pub user_id: Id,
    /// Terminal host of the chain.
    pub host_id: Id,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub err_msg: String,
}
