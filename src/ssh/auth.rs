use russh::keys::{PublicKey, PublicKeyBase64};
use tracing::{info, warn};

use crate::store::models::{User, UserKey};
use crate::store::Store;

/// What the inbound user string asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserType {
    /// Liveness probe; the only identity password auth will grant.
    Healthcheck,
    /// Administrative shell.
    Shell,
    /// One-shot key enrollment via `invite:<token>`.
    Invite,
    /// Anything else names a target host.
    Bastion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Password,
    Pubkey,
}

/// Classify the inbound user string. Pure function; rules are evaluated
/// in order and the first match wins.
pub fn classify(input_username: &str, user: &User) -> UserType {
    if input_username == "healthcheck" {
        UserType::Healthcheck
    } else if input_username == user.name
        || input_username == user.email
        || input_username == "admin"
    {
        UserType::Shell
    } else if input_username.starts_with("invite:") {
        UserType::Invite
    } else {
        UserType::Bastion
    }
}

/// Authentication state of one inbound connection.
///
/// Created by an auth hook, owned by the connection handler, dropped at
/// disconnect. Scalars are fixed once attached; `err` and `message` are
/// set before the first channel is accepted and observed exactly once.
pub struct AuthContext {
    pub input_username: String,
    pub user: User,
    pub user_key: Option<UserKey>,
    pub auth_method: AuthMethod,
    /// Whether the SSH handshake proceeds. User-visible failures do NOT
    /// flip this; they travel via `err` to the first channel instead.
    pub auth_success: bool,
    pub err: Option<String>,
    pub message: Option<String>,
}

impl AuthContext {
    fn new(input_username: &str, auth_method: AuthMethod) -> Self {
        Self {
            input_username: input_username.to_string(),
            user: User::anonymous(),
            user_key: None,
            auth_method,
            auth_success: false,
            err: None,
            message: None,
        }
    }

    pub fn user_type(&self) -> UserType {
        classify(&self.input_username, &self.user)
    }
}

/// Password auth is deliberately a liveness probe surface: only the
/// literal `healthcheck` user is authorized, with any password.
pub fn password_auth(input_username: &str, _password: &str) -> AuthContext {
    let mut actx = AuthContext::new(input_username, AuthMethod::Password);
    actx.auth_success = actx.user_type() == UserType::Healthcheck;
    actx
}

/// Resolve a presented public key to an auth context.
///
/// The handshake is allowed to proceed on most failures so the operator
/// sees readable text on the first channel instead of an opaque
/// handshake rejection; only a disabled account refuses outright.
pub async fn pubkey_auth(store: &Store, input_username: &str, key: &PublicKey) -> AuthContext {
    let mut actx = AuthContext::new(input_username, AuthMethod::Pubkey);
    actx.auth_success = true;

    let authorized = authorized_key_line(key);

    if let Some(user_key) = store.user_key_by_authorized_key(&authorized).await {
        if let Some(user) = store.user_by_id(user_key.user_id).await {
            actx.user = user;
            actx.user_key = Some(user_key);

            if actx.user.is_disabled() {
                actx.err = Some("this account has been disabled".to_string());
                actx.auth_success = false;
                return actx;
            }
            if actx.user_type() == UserType::Invite {
                actx.err = Some(format!(
                    "invites are only supported for new SSH keys; your ssh key is already associated with the user {:?}",
                    actx.user.email
                ));
            }
            return actx;
        }
        warn!(user_id = user_key.user_id, "Key row references a missing user");
    }

    // Unknown key presented under an invite username: enroll it.
    if actx.user_type() == UserType::Invite {
        let token = actx
            .input_username
            .split_once(':')
            .map(|(_, t)| t)
            .unwrap_or("");

        let invited = if token.is_empty() {
            None
        } else {
            store.user_by_invite_token(token).await
        };

        match invited {
            Some(user) => {
                let user_key = store
                    .create_user_key(user.id, &authorized, "enrolled by invite")
                    .await;
                if let Err(e) = store.clear_invite_token(user.id).await {
                    warn!(user_id = user.id, error = %e, "Failed to clear invite token");
                }
                info!(user = %user.email, "Key enrolled via invite token");
                actx.message = Some(format!(
                    "Welcome {}!\n\nYour key is now associated with the user {:?}.\n",
                    user.name, user.email
                ));
                actx.user = user;
                actx.user_key = Some(user_key);
            }
            None => {
                actx.err = Some("your token is invalid or expired".to_string());
            }
        }
        return actx;
    }

    // Unknown key, no invite. The handshake still proceeds so the text
    // below reaches the first channel; the dispatcher's anonymous guard
    // keeps the connection from going anywhere.
    actx.err = Some("unknown ssh key".to_string());
    actx
}

/// OpenSSH authorized-key line for a public key, the form keys are stored
/// and looked up in.
pub fn authorized_key_line(key: &PublicKey) -> String {
    format!("{} {}", key.algorithm().as_str(), key.public_key_base64())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved_user(name: &str, email: &str) -> User {
        User {
            name: name.to_string(),
            email: email.to_string(),
            id: 3,
            ..User::anonymous()
        }
    }

    #[test]
    fn healthcheck_is_unconditional() {
        let user = resolved_user("healthcheck", "healthcheck@example.com");
        assert_eq!(classify("healthcheck", &user), UserType::Healthcheck);
        assert_eq!(classify("healthcheck", &User::anonymous()), UserType::Healthcheck);
    }

    #[test]
    fn own_name_email_or_admin_is_shell() {
        let user = resolved_user("alice", "alice@example.com");
        assert_eq!(classify("alice", &user), UserType::Shell);
        assert_eq!(classify("alice@example.com", &user), UserType::Shell);
        assert_eq!(classify("admin", &user), UserType::Shell);
    }

    #[test]
    fn invite_prefix_wins_over_bastion() {
        let user = resolved_user("alice", "alice@example.com");
        assert_eq!(classify("invite:TK1", &user), UserType::Invite);
    }

    #[test]
    fn anything_else_is_a_host_name() {
        let user = resolved_user("alice", "alice@example.com");
        assert_eq!(classify("web01", &user), UserType::Bastion);
        assert_eq!(classify("bob", &user), UserType::Bastion);
    }

    #[test]
    fn classification_is_pure() {
        let user = resolved_user("alice", "alice@example.com");
        for _ in 0..3 {
            assert_eq!(classify("web01", &user), UserType::Bastion);
            assert_eq!(classify("admin", &user), UserType::Shell);
        }
    }

    #[test]
    fn password_auth_only_grants_healthcheck() {
        assert!(password_auth("healthcheck", "").auth_success);
        assert!(password_auth("healthcheck", "anything").auth_success);
        assert!(!password_auth("alice", "hunter2").auth_success);
        assert!(!password_auth("web01", "").auth_success);
    }

    #[test]
    fn password_context_shape() {
        let actx = password_auth("healthcheck", "");
        assert_eq!(actx.auth_method, AuthMethod::Password);
        assert_eq!(actx.user.id, 0);
        assert!(actx.err.is_none());
    }
}
