// Auth engine behavior over the store:
// - password auth is a healthcheck-only surface
// - unknown keys succeed the handshake but carry a deferred error
// - invite tokens enroll a key exactly once
// - disabled accounts refuse the handshake

mod common;

use rand::rngs::OsRng;
use russh::keys::{Algorithm, PrivateKey, PublicKey};
use sshgate::ssh::auth::{authorized_key_line, password_auth, pubkey_auth, AuthMethod, UserType};
use sshgate::store::models::USER_DISABLED;

fn fresh_key() -> PublicKey {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .unwrap()
        .public_key()
        .clone()
}

#[test]
fn password_auth_grants_only_healthcheck() {
    let actx = password_auth("healthcheck", "");
    assert!(actx.auth_success);
    assert_eq!(actx.auth_method, AuthMethod::Password);
    assert_eq!(actx.user_type(), UserType::Healthcheck);

    assert!(!password_auth("alice", "hunter2").auth_success);
    assert!(!password_auth("web01", "").auth_success);
}

#[tokio::test]
async fn unknown_key_defers_error_but_proceeds() {
    let ctx = common::test_context();
    let actx = pubkey_auth(&ctx.store, "anything", &fresh_key()).await;

    assert!(actx.auth_success);
    assert_eq!(actx.err.as_deref(), Some("unknown ssh key"));
    assert_eq!(actx.user.id, 0);
    assert_eq!(actx.user.name, "Anonymous");
}

#[tokio::test]
async fn known_key_resolves_user() {
    let ctx = common::test_context();
    let (user, _) = common::enrolled_user(&ctx, "alice").await;
    let key = fresh_key();
    ctx.store
        .create_user_key(user.id, &authorized_key_line(&key), "")
        .await;

    let actx = pubkey_auth(&ctx.store, "web01", &key).await;
    assert!(actx.auth_success);
    assert!(actx.err.is_none());
    assert_eq!(actx.user.id, user.id);
    assert_eq!(actx.user_type(), UserType::Bastion);
    assert!(actx.user_key.is_some());
}

#[tokio::test]
async fn own_name_resolves_to_shell() {
    let ctx = common::test_context();
    let (user, _) = common::enrolled_user(&ctx, "alice").await;
    let key = fresh_key();
    ctx.store
        .create_user_key(user.id, &authorized_key_line(&key), "")
        .await;

    let actx = pubkey_auth(&ctx.store, "alice", &key).await;
    assert_eq!(actx.user_type(), UserType::Shell);
    let actx = pubkey_auth(&ctx.store, "alice@example.com", &key).await;
    assert_eq!(actx.user_type(), UserType::Shell);
}

#[tokio::test]
async fn disabled_account_refuses_handshake() {
    let ctx = common::test_context();
    let (user, _) = common::enrolled_user(&ctx, "mallory").await;
    let key = fresh_key();
    ctx.store
        .create_user_key(user.id, &authorized_key_line(&key), "")
        .await;
    ctx.store.set_user_comment(user.id, USER_DISABLED).await.unwrap();

    let actx = pubkey_auth(&ctx.store, "mallory", &key).await;
    assert!(!actx.auth_success);
    assert_eq!(actx.err.as_deref(), Some("this account has been disabled"));
}

#[tokio::test]
async fn invite_enrolls_key_and_burns_token() {
    let ctx = common::test_context();
    let invited = ctx
        .store
        .create_user("bob", "bob@example.com", "TK1")
        .await;
    let key = fresh_key();

    let actx = pubkey_auth(&ctx.store, "invite:TK1", &key).await;
    assert!(actx.auth_success);
    assert!(actx.err.is_none());
    assert_eq!(actx.user.id, invited.id);
    assert!(actx.message.as_deref().unwrap().contains("Welcome bob"));

    // The key is bound to the invited user.
    let bound = ctx
        .store
        .user_key_by_authorized_key(&authorized_key_line(&key))
        .await
        .unwrap();
    assert_eq!(bound.user_id, invited.id);

    // The token is single-use.
    let refreshed = ctx.store.user_by_id(invited.id).await.unwrap();
    assert!(refreshed.invite_token.is_empty());

    let second = pubkey_auth(&ctx.store, "invite:TK1", &fresh_key()).await;
    assert!(second.auth_success);
    assert_eq!(second.err.as_deref(), Some("your token is invalid or expired"));
    assert_eq!(second.user.id, 0);
}

#[tokio::test]
async fn invite_with_registered_key_warns_but_proceeds() {
    let ctx = common::test_context();
    let (user, _) = common::enrolled_user(&ctx, "carol").await;
    let key = fresh_key();
    ctx.store
        .create_user_key(user.id, &authorized_key_line(&key), "")
        .await;

    let actx = pubkey_auth(&ctx.store, "invite:whatever", &key).await;
    assert!(actx.auth_success);
    assert!(actx
        .err
        .as_deref()
        .unwrap()
        .contains("already associated with the user"));
    // No second key row appeared.
    assert_eq!(ctx.store.user_keys().await.len(), 1);
}

#[tokio::test]
async fn invalid_token_is_anonymous_but_proceeds() {
    let ctx = common::test_context();
    let actx = pubkey_auth(&ctx.store, "invite:NOPE", &fresh_key()).await;
    assert!(actx.auth_success);
    assert_eq!(actx.err.as_deref(), Some("your token is invalid or expired"));
    assert_eq!(actx.user.id, 0);
    assert!(ctx.store.user_keys().await.is_empty());
}
