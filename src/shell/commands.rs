use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::context::AppContext;
use crate::ssh::auth::AuthMethod;
use crate::store::models::{SessionStatus, User};

/// Result of one executed shell line.
pub struct ExecResult {
    pub output: String,
    pub exit: bool,
}

impl ExecResult {
    fn text(output: String) -> Self {
        Self {
            output,
            exit: false,
        }
    }
}

/// Interprets administrative commands against the policy store.
pub struct CommandExecutor {
    ctx: Arc<AppContext>,
    user: User,
    auth_method: AuthMethod,
}

impl CommandExecutor {
    pub fn new(ctx: Arc<AppContext>, user: User, auth_method: AuthMethod) -> Self {
        Self {
            ctx,
            user,
            auth_method,
        }
    }

    pub fn prompt(&self) -> String {
        format!("{}@sshgate> ", self.user.name)
    }

    pub async fn execute(&self, line: &str) -> ExecResult {
        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else {
            return ExecResult::text(String::new());
        };
        let args: Vec<&str> = parts.collect();

        match (command, args.as_slice()) {
            ("help", _) => ExecResult::text(self.help()),
            ("whoami", _) | ("info", _) => ExecResult::text(self.whoami()),
            ("host", ["ls"]) => ExecResult::text(self.host_ls().await),
            ("host", ["inspect", name]) => ExecResult::text(self.host_inspect(name).await),
            ("user", ["ls"]) => ExecResult::text(self.user_ls().await),
            ("key", ["ls"]) => ExecResult::text(self.key_ls().await),
            ("session", ["ls"]) => ExecResult::text(self.session_ls().await),
            ("session", ["kill", id]) => ExecResult::text(self.session_kill(id).await),
            ("exit", _) | ("quit", _) | ("logout", _) => ExecResult {
                output: "bye\r\n".to_string(),
                exit: true,
            },
            _ => ExecResult::text(format!(
                "unknown command: {command:?} (try 'help')\r\n"
            )),
        }
    }

    fn help(&self) -> String {
        concat!(
            "commands:\r\n",
            "  help                  this text\r\n",
            "  whoami                show the authenticated identity\r\n",
            "  host ls               list target hosts\r\n",
            "  host inspect <name>   show one host\r\n",
            "  user ls               list users\r\n",
            "  key ls                list enrolled user keys\r\n",
            "  session ls            list session records\r\n",
            "  session kill <id>     disconnect a live session\r\n",
            "  exit                  leave the shell\r\n",
        )
        .to_string()
    }

    fn whoami(&self) -> String {
        let method = match self.auth_method {
            AuthMethod::Password => "password",
            AuthMethod::Pubkey => "pubkey",
        };
        format!(
            "user: {} <{}> (id {}, auth {})\r\n",
            self.user.name, self.user.email, self.user.id, method
        )
    }

    async fn host_ls(&self) -> String {
        let hosts = self.ctx.store.hosts().await;
        if hosts.is_empty() {
            return "no hosts registered\r\n".to_string();
        }
        let mut out = format!(
            "{:<16} {:<24} {:<8} {:<6} {}\r\n",
            "NAME", "ADDR", "SCHEME", "HOP", "LOGGING"
        );
        for h in hosts {
            out.push_str(&format!(
                "{:<16} {:<24} {:<8} {:<6} {:?}\r\n",
                h.name,
                h.addr,
                h.scheme,
                h.hop_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()),
                h.logging
            ));
        }
        out
    }

    async fn host_inspect(&self, name: &str) -> String {
        let Some(host) = self.ctx.store.host_by_name(name).await else {
            return format!("error: unknown host: {name}\r\n");
        };
        let mut out = format!("name:        {}\r\n", host.name);
        out.push_str(&format!("addr:        {}\r\n", host.addr));
        out.push_str(&format!("username:    {}\r\n", host.username));
        out.push_str(&format!("scheme:      {}\r\n", host.scheme));
        out.push_str(&format!("logging:     {:?}\r\n", host.logging));
        out.push_str(&format!(
            "hop:         {}\r\n",
            host.hop_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string())
        ));
        out.push_str(&format!(
            "credential:  {}\r\n",
            if host.password.is_some() {
                "password"
            } else if host.ssh_key_id.is_some() {
                "ssh key"
            } else {
                "none"
            }
        ));
        out.push_str(&format!(
            "fingerprint: {}\r\n",
            if host.host_key.is_empty() {
                "not yet recorded"
            } else {
                "recorded"
            }
        ));
        out
    }

    async fn user_ls(&self) -> String {
        let users = self.ctx.store.users().await;
        if users.is_empty() {
            return "no users\r\n".to_string();
        }
        let mut out = format!("{:<6} {:<16} {:<28} {}\r\n", "ID", "NAME", "EMAIL", "INVITE");
        for u in users {
            out.push_str(&format!(
                "{:<6} {:<16} {:<28} {}\r\n",
                u.id,
                u.name,
                u.email,
                if u.invite_token.is_empty() { "-" } else { "pending" }
            ));
        }
        out
    }

    async fn key_ls(&self) -> String {
        let keys = self.ctx.store.user_keys().await;
        if keys.is_empty() {
            return "no keys enrolled\r\n".to_string();
        }
        let mut out = format!("{:<6} {:<8} {}\r\n", "ID", "USER", "COMMENT");
        for k in keys {
            out.push_str(&format!("{:<6} {:<8} {}\r\n", k.id, k.user_id, k.comment));
        }
        out
    }

    async fn session_ls(&self) -> String {
        let sessions = self.ctx.store.sessions().await;
        if sessions.is_empty() {
            return "no sessions\r\n".to_string();
        }
        let mut out = format!(
            "{:<6} {:<6} {:<6} {:<8} {:<22} {}\r\n",
            "ID", "USER", "HOST", "STATUS", "STARTED", "ERROR"
        );
        for s in sessions {
            out.push_str(&format!(
                "{:<6} {:<6} {:<6} {:<8} {:<22} {}\r\n",
                s.id,
                s.user_id,
                s.host_id,
                match s.status {
                    SessionStatus::Active => "active",
                    SessionStatus::Closed => "closed",
                },
                fmt_time(&s.started_at),
                s.err_msg
            ));
        }
        out
    }

    async fn session_kill(&self, id: &str) -> String {
        let Ok(id) = id.parse::<u64>() else {
            return format!("error: invalid session id: {id:?}\r\n");
        };
        match self.ctx.store.session_by_id(id).await {
            None => format!("error: no session with id {id}\r\n"),
            Some(s) if s.status == SessionStatus::Closed => {
                format!("session {id} is already closed\r\n")
            }
            Some(_) => {
                if self.ctx.registry.disconnect(id) {
                    format!("session {id} disconnected\r\n")
                } else {
                    format!("no live connection for session {id}\r\n")
                }
            }
        }
    }
}

fn fmt_time(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}
