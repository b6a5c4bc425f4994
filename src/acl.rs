use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::store::models::{Acl, AclAction, Host, User};

/// Decide whether `user` may reach `host`.
///
/// A rule applies when the user belongs to one of its user groups AND the
/// host either belongs to one of its host groups or matches its host-name
/// pattern. Applicable rules are ordered by ascending weight; the first
/// action wins. With no applicable rule the optional external check
/// command decides, otherwise the answer is deny.
pub async fn evaluate(
    user: &User,
    host: &Host,
    acls: &[Acl],
    check_cmd: Option<&str>,
) -> Result<AclAction> {
    let mut applicable: Vec<&Acl> = acls
        .iter()
        .filter(|acl| applies(acl, user, host))
        .collect();
    applicable.sort_by_key(|acl| acl.weight);

    if let Some(acl) = applicable.first() {
        log_decision(user, host, acl.action, Some(acl.id));
        return Ok(acl.action);
    }

    if let Some(cmd) = check_cmd {
        let action = run_check_cmd(cmd, user, host).await?;
        log_decision(user, host, action, None);
        return Ok(action);
    }

    log_decision(user, host, AclAction::Deny, None);
    Ok(AclAction::Deny)
}

fn applies(acl: &Acl, user: &User, host: &Host) -> bool {
    let user_matches = acl
        .user_group_ids
        .iter()
        .any(|g| user.group_ids.contains(g));
    if !user_matches {
        return false;
    }

    let host_in_group = acl
        .host_group_ids
        .iter()
        .any(|g| host.group_ids.contains(g));
    let pattern_matches =
        !acl.host_pattern.is_empty() && glob_match(&acl.host_pattern, &host.name);
    host_in_group || pattern_matches
}

/// Run the operator-configured check command. Its trimmed stdout must be
/// `allow` or `deny`; anything else is a configuration error.
async fn run_check_cmd(cmd: &str, user: &User, host: &Host) -> Result<AclAction> {
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .env("SSHGATE_USER", &user.email)
        .env("SSHGATE_HOST", &host.name)
        .output()
        .await
        .with_context(|| format!("running ACL check command {cmd:?}"))?;

    let verdict = String::from_utf8_lossy(&output.stdout).trim().to_string();
    match verdict.as_str() {
        "allow" => Ok(AclAction::Allow),
        "deny" => Ok(AclAction::Deny),
        other => anyhow::bail!("invalid ACL action: {other:?}"),
    }
}

fn log_decision(user: &User, host: &Host, action: AclAction, acl_id: Option<u64>) {
    match action {
        AclAction::Allow => info!(
            user = %user.email,
            host = %host.name,
            acl_id = ?acl_id,
            "ACL: allowed"
        ),
        AclAction::Deny => warn!(
            user = %user.email,
            host = %host.name,
            acl_id = ?acl_id,
            "ACL: denied"
        ),
    }
}

/// Minimal glob: `*` matches any run of characters, everything else is
/// literal.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    fn inner(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..]))
            }
            (Some(pc), Some(nc)) if pc == nc => inner(&p[1..], &n[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}
