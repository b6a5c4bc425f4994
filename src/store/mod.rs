pub mod models;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use self::models::{Acl, Group, Host, Id, Session, SessionStatus, SshKey, User, UserKey};

/// Serialized store payload.
///
/// All collections use `#[serde(default)]` so partial/old files
/// deserialize gracefully.
#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    #[serde(default)]
    next_id: Id,
    #[serde(default)]
    users: Vec<User>,
    #[serde(default)]
    user_keys: Vec<UserKey>,
    #[serde(default)]
    groups: Vec<Group>,
    #[serde(default)]
    acls: Vec<Acl>,
    #[serde(default)]
    hosts: Vec<Host>,
    #[serde(default)]
    ssh_keys: Vec<SshKey>,
    #[serde(default)]
    sessions: Vec<Session>,
}

impl State {
    fn allocate(&mut self) -> Id {
        self.next_id += 1;
        self.next_id
    }
}

/// The policy store: users, keys, hosts, groups, ACLs and session records.
///
/// In-memory tables behind one `RwLock`, optionally mirrored to a JSON
/// file after every mutation. Ids are monotonically allocated.
pub struct Store {
    state: RwLock<State>,
    path: Option<PathBuf>,
}

impl Store {
    /// Open a file-backed store, loading existing state when present.
    pub fn open(path: &Path) -> Result<Self> {
        let state = match load_state(path)? {
            Some(state) => state,
            None => State::default(),
        };
        Ok(Self {
            state: RwLock::new(state),
            path: Some(path.to_path_buf()),
        })
    }

    /// In-memory store, nothing written to disk. Used by demo mode and tests.
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(State::default()),
            path: None,
        }
    }

    fn persist(&self, state: &State) {
        let Some(ref path) = self.path else { return };
        if let Err(e) = save_state(path, state) {
            warn!(path = %path.display(), error = %e, "Failed to persist store");
        }
    }

    /// Allocate an id from the shared counter without creating a row.
    /// Used for internal (non-persisted) session bookkeeping so those ids
    /// never collide with stored session ids.
    pub async fn next_internal_id(&self) -> Id {
        let mut state = self.state.write().await;
        let id = state.allocate();
        self.persist(&state);
        id
    }

    // ---- users & keys ----

    pub async fn create_user(&self, name: &str, email: &str, invite_token: &str) -> User {
        let mut state = self.state.write().await;
        let user = User {
            id: state.allocate(),
            name: name.to_string(),
            email: email.to_string(),
            comment: String::new(),
            invite_token: invite_token.to_string(),
            group_ids: Vec::new(),
            created_at: Utc::now(),
        };
        state.users.push(user.clone());
        self.persist(&state);
        user
    }

    pub async fn user_by_id(&self, id: Id) -> Option<User> {
        self.state.read().await.users.iter().find(|u| u.id == id).cloned()
    }

    pub async fn user_by_invite_token(&self, token: &str) -> Option<User> {
        self.state
            .read()
            .await
            .users
            .iter()
            .find(|u| !u.invite_token.is_empty() && u.invite_token == token)
            .cloned()
    }

    pub async fn users(&self) -> Vec<User> {
        self.state.read().await.users.clone()
    }

    pub async fn set_user_comment(&self, id: Id, comment: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let user = state
            .users
            .iter_mut()
            .find(|u| u.id == id)
            .with_context(|| format!("no user with id {id}"))?;
        user.comment = comment.to_string();
        self.persist(&state);
        Ok(())
    }

    pub async fn add_user_to_group(&self, user_id: Id, group_id: Id) -> Result<()> {
        let mut state = self.state.write().await;
        let user = state
            .users
            .iter_mut()
            .find(|u| u.id == user_id)
            .with_context(|| format!("no user with id {user_id}"))?;
        if !user.group_ids.contains(&group_id) {
            user.group_ids.push(group_id);
        }
        self.persist(&state);
        Ok(())
    }

    /// Invite tokens are single-use: cleared as soon as a key is enrolled.
    pub async fn clear_invite_token(&self, user_id: Id) -> Result<()> {
        let mut state = self.state.write().await;
        let user = state
            .users
            .iter_mut()
            .find(|u| u.id == user_id)
            .with_context(|| format!("no user with id {user_id}"))?;
        user.invite_token.clear();
        self.persist(&state);
        Ok(())
    }

    pub async fn user_key_by_authorized_key(&self, authorized_key: &str) -> Option<UserKey> {
        self.state
            .read()
            .await
            .user_keys
            .iter()
            .find(|k| k.authorized_key == authorized_key)
            .cloned()
    }

    pub async fn create_user_key(
        &self,
        user_id: Id,
        authorized_key: &str,
        comment: &str,
    ) -> UserKey {
        let mut state = self.state.write().await;
        let key = UserKey {
            id: state.allocate(),
            user_id,
            authorized_key: authorized_key.to_string(),
            comment: comment.to_string(),
            created_at: Utc::now(),
        };
        state.user_keys.push(key.clone());
        self.persist(&state);
        key
    }

    pub async fn user_keys(&self) -> Vec<UserKey> {
        self.state.read().await.user_keys.clone()
    }

    // ---- groups & acls ----

    pub async fn create_group(&self, name: &str) -> Group {
        let mut state = self.state.write().await;
        let group = Group {
            id: state.allocate(),
            name: name.to_string(),
        };
        state.groups.push(group.clone());
        self.persist(&state);
        group
    }

    pub async fn create_acl(&self, acl: Acl) -> Acl {
        let mut state = self.state.write().await;
        let acl = Acl {
            id: state.allocate(),
            ..acl
        };
        state.acls.push(acl.clone());
        self.persist(&state);
        acl
    }

    pub async fn acls(&self) -> Vec<Acl> {
        self.state.read().await.acls.clone()
    }

    // ---- hosts ----

    pub async fn create_host(&self, host: Host) -> Host {
        let mut state = self.state.write().await;
        let host = Host {
            id: state.allocate(),
            created_at: Utc::now(),
            ..host
        };
        state.hosts.push(host.clone());
        self.persist(&state);
        host
    }

    pub async fn host_by_name(&self, name: &str) -> Option<Host> {
        self.state.read().await.hosts.iter().find(|h| h.name == name).cloned()
    }

    /// Hop resolution goes by primary key: renames cannot break a chain.
    pub async fn host_by_id(&self, id: Id) -> Option<Host> {
        self.state.read().await.hosts.iter().find(|h| h.id == id).cloned()
    }

    pub async fn hosts(&self) -> Vec<Host> {
        self.state.read().await.hosts.clone()
    }

    pub async fn add_host_to_group(&self, host_id: Id, group_id: Id) -> Result<()> {
        let mut state = self.state.write().await;
        let host = state
            .hosts
            .iter_mut()
            .find(|h| h.id == host_id)
            .with_context(|| format!("no host with id {host_id}"))?;
        if !host.group_ids.contains(&group_id) {
            host.group_ids.push(group_id);
        }
        self.persist(&state);
        Ok(())
    }

    pub async fn set_host_hop(&self, host_id: Id, hop_id: Option<Id>) -> Result<()> {
        let mut state = self.state.write().await;
        let host = state
            .hosts
            .iter_mut()
            .find(|h| h.id == host_id)
            .with_context(|| format!("no host with id {host_id}"))?;
        host.hop_id = hop_id;
        self.persist(&state);
        Ok(())
    }

    /// Record the marshaled host key seen on first contact. Never rewrites
    /// an existing fingerprint.
    pub async fn record_host_key(&self, host_id: Id, key: Vec<u8>) -> Result<()> {
        let mut state = self.state.write().await;
        let host = state
            .hosts
            .iter_mut()
            .find(|h| h.id == host_id)
            .with_context(|| format!("no host with id {host_id}"))?;
        if host.host_key.is_empty() {
            host.host_key = key;
            self.persist(&state);
        }
        Ok(())
    }

    // ---- bastion ssh keys ----

    pub async fn ssh_key_by_name(&self, name: &str) -> Option<SshKey> {
        self.state
            .read()
            .await
            .ssh_keys
            .iter()
            .find(|k| k.name == name)
            .cloned()
    }

    pub async fn ssh_key_by_id(&self, id: Id) -> Option<SshKey> {
        self.state.read().await.ssh_keys.iter().find(|k| k.id == id).cloned()
    }

    pub async fn create_ssh_key(&self, name: &str, priv_key: Vec<u8>, pub_key: &str) -> SshKey {
        let mut state = self.state.write().await;
        let key = SshKey {
            id: state.allocate(),
            name: name.to_string(),
            priv_key,
            pub_key: pub_key.to_string(),
            created_at: Utc::now(),
        };
        state.ssh_keys.push(key.clone());
        self.persist(&state);
        key
    }

    // ---- sessions ----

    /// Create a session row with status `active`.
    pub async fn create_session(&self, user_id: Id, host_id: Id) -> Session {
        let mut state = self.state.write().await;
        let session = Session {
            id: state.allocate(),
            user_id,
            host_id,
            status: SessionStatus::Active,
            started_at: Utc::now(),
            stopped_at: None,
            err_msg: String::new(),
        };
        state.sessions.push(session.clone());
        self.persist(&state);
        session
    }

    /// Close a session row, stamping `stopped_at` and the error message.
    pub async fn close_session(&self, id: Id, err_msg: Option<String>) -> Result<()> {
        let mut state = self.state.write().await;
        let session = state
            .sessions
            .iter_mut()
            .find(|s| s.id == id)
            .with_context(|| format!("no session with id {id}"))?;
        session.status = SessionStatus::Closed;
        session.stopped_at = Some(Utc::now());
        session.err_msg = err_msg.unwrap_or_default();
        self.persist(&state);
        Ok(())
    }

    pub async fn session_by_id(&self, id: Id) -> Option<Session> {
        self.state.read().await.sessions.iter().find(|s| s.id == id).cloned()
    }

    pub async fn sessions(&self) -> Vec<Session> {
        self.state.read().await.sessions.clone()
    }
}

/// Atomically write the store to disk: temp file, fsync, rename.
fn save_state(path: &Path, state: &State) -> std::io::Result<()> {
    let data = serde_json::to_string_pretty(state)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let tmp_path = path.with_extension("tmp");
    let mut file = std::fs::File::create(&tmp_path)?;
    file.write_all(data.as_bytes())?;
    file.sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
    }

    std::fs::rename(&tmp_path, path)?;
    debug!(path = %path.display(), "Store saved");
    Ok(())
}

/// Returns `Ok(None)` when the file does not exist.
fn load_state(path: &Path) -> Result<Option<State>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading store: {}", path.display()))?;
    let state: State = serde_json::from_str(&data)
        .with_context(|| format!("parsing store: {}", path.display()))?;
    debug!(
        path = %path.display(),
        users = state.users.len(),
        hosts = state.hosts.len(),
        "Store loaded"
    );
    Ok(Some(state))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn session_lifecycle() {
        let store = Store::in_memory();
        let sess = store.create_session(3, 7).await;
        assert_eq!(sess.status, SessionStatus::Active);
        assert!(sess.stopped_at.is_none());

        store.close_session(sess.id, None).await.unwrap();
        let closed = store.session_by_id(sess.id).await.unwrap();
        assert_eq!(closed.status, SessionStatus::Closed);
        assert!(closed.stopped_at.unwrap() >= closed.started_at);
        assert!(closed.err_msg.is_empty());
    }

    #[tokio::test]
    async fn session_close_records_error() {
        let store = Store::in_memory();
        let sess = store.create_session(1, 1).await;
        store
            .close_session(sess.id, Some("dial failed".to_string()))
            .await
            .unwrap();
        assert_eq!(store.session_by_id(sess.id).await.unwrap().err_msg, "dial failed");
    }

    #[tokio::test]
    async fn invite_token_lookup_ignores_empty() {
        let store = Store::in_memory();
        store.create_user("alice", "alice@example.com", "").await;
        assert!(store.user_by_invite_token("").await.is_none());
    }

    #[tokio::test]
    async fn host_key_recorded_once() {
        let store = Store::in_memory();
        let host = store
            .create_host(Host {
                id: 0,
                name: "web01".to_string(),
                addr: "10.0.0.1:22".to_string(),
                username: "root".to_string(),
                scheme: "ssh".to_string(),
                password: None,
                ssh_key_id: None,
                hop_id: None,
                logging: models::LoggingMode::Everything,
                host_key: Vec::new(),
                group_ids: Vec::new(),
                created_at: Utc::now(),
            })
            .await;

        store.record_host_key(host.id, b"first".to_vec()).await.unwrap();
        store.record_host_key(host.id, b"second".to_vec()).await.unwrap();
        assert_eq!(store.host_by_id(host.id).await.unwrap().host_key, b"first");
    }

    #[tokio::test]
    async fn ids_are_monotonic() {
        let store = Store::in_memory();
        let a = store.create_user("a", "a@x", "").await;
        let b = store.create_user("b", "b@x", "").await;
        let c = store.next_internal_id().await;
        assert!(a.id < b.id && b.id < c);
    }

    #[tokio::test]
    async fn file_store_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        {
            let store = Store::open(&path).unwrap();
            store.create_user("alice", "alice@example.com", "TK1").await;
        }
        let store = Store::open(&path).unwrap();
        let user = store.user_by_invite_token("TK1").await.unwrap();
        assert_eq!(user.name, "alice");
    }
}
