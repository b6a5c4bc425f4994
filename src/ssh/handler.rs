use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use russh::keys::PublicKey;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodKind, MethodSet};
use tracing::{debug, info, warn};

use crate::context::AppContext;
use crate::session::cache::{direct_tcp_fingerprint, DirectTcpEntry};
use crate::session::{self, build_route, ChannelKind, Route, SessionConfig};
use crate::shell::commands::CommandExecutor;
use crate::shell::ShellSession;
use crate::ssh::auth::{self, AuthContext, UserType};
use crate::store::models::Host;
use crate::telnet;

static CONN_SEQ: AtomicU64 = AtomicU64::new(0);

/// Per-connection SSH handler: auth hooks populate the auth context, then
/// every channel open is dispatched on the resolved user type.
pub struct SshHandler {
    ctx: Arc<AppContext>,
    peer_addr: SocketAddr,
    conn_id: u64,
    auth: Option<AuthContext>,
    channels: HashMap<ChannelId, ChannelState>,
}

/// Dispatcher state of one channel between open and its session request.
enum ChannelState {
    /// Bastion target resolved to an SSH hop chain; the pump starts once
    /// the client asks for a shell, a command, or a forward.
    PendingChain {
        channel: Channel<Msg>,
        chain: Vec<SessionConfig>,
        term: String,
        cols: u32,
        rows: u32,
    },
    /// Bastion target with a telnet scheme.
    PendingTelnet {
        channel: Channel<Msg>,
        host: Host,
    },
    /// Administrative shell.
    Shell(ShellSession),
    /// Only a deferred error/message/healthcheck reply is owed; answered
    /// at the first session request, then closed.
    Message,
}

impl SshHandler {
    pub fn new(ctx: Arc<AppContext>, peer_addr: SocketAddr) -> Self {
        Self {
            ctx,
            peer_addr,
            conn_id: CONN_SEQ.fetch_add(1, Ordering::Relaxed),
            auth: None,
            channels: HashMap::new(),
        }
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Write the deferred error (or a plain access-denied) and close.
    /// Spawned so the open confirmation goes out first.
    fn deny_channel(&self, channel: Channel<Msg>) {
        let actx = self.auth.as_ref();
        let msg = actx
            .and_then(|a| a.err.clone())
            .unwrap_or_else(|| "access denied".to_string());
        warn!(
            conn_id = self.conn_id,
            ssh_user = %actx.map(|a| a.input_username.as_str()).unwrap_or(""),
            remote = %self.peer_addr,
            "Access denied"
        );
        tokio::spawn(async move {
            session::reply_error(&channel, &msg).await;
        });
    }

    fn reject_channel(&self, channel: Channel<Msg>, msg: String) {
        tokio::spawn(async move {
            session::reply_error(&channel, &msg).await;
        });
    }

    /// Move a pending bastion channel into its pump task. `command` is
    /// set for exec requests, absent for interactive shells.
    fn start_proxy(&mut self, channel_id: ChannelId, command: Option<String>) {
        let Some(actx) = self.auth.as_ref() else { return };
        let user_id = actx.user.id;
        match self.channels.remove(&channel_id) {
            Some(ChannelState::PendingChain {
                channel,
                chain,
                term,
                cols,
                rows,
            }) => {
                let kind = match command {
                    Some(command) => ChannelKind::Exec { command },
                    None => ChannelKind::Shell { term, cols, rows },
                };
                let ctx = self.ctx.clone();
                tokio::spawn(async move {
                    session::run_chain_session(ctx, channel, chain, user_id, kind, true).await;
                });
            }
            Some(ChannelState::PendingTelnet { channel, host }) => {
                let ctx = self.ctx.clone();
                tokio::spawn(async move {
                    telnet::run_telnet_session(ctx, channel, host, user_id).await;
                });
            }
            Some(other) => {
                self.channels.insert(channel_id, other);
            }
            None => {}
        }
    }

    /// Deliver the deferred reply owed on a `Message` channel.
    fn respond_message(&self, channel_id: ChannelId, session: &mut Session) {
        let Some(actx) = self.auth.as_ref() else { return };

        if let Some(err) = &actx.err {
            let text = format!("error: {err}\n");
            let _ = session.data(channel_id, CryptoVec::from_slice(text.as_bytes()));
            let _ = session.exit_status_request(channel_id, 1);
            let _ = session.close(channel_id);
            return;
        }
        if let Some(message) = &actx.message {
            let _ = session.data(channel_id, CryptoVec::from_slice(message.as_bytes()));
        }
        if actx.user_type() == UserType::Healthcheck {
            let _ = session.data(channel_id, CryptoVec::from_slice(b"OK\n"));
        }
        let _ = session.exit_status_request(channel_id, 0);
        let _ = session.close(channel_id);
    }
}

impl russh::server::Handler for SshHandler {
    type Error = anyhow::Error;

    async fn auth_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> Result<Auth, Self::Error> {
        let actx = auth::password_auth(user, password);
        let ok = actx.auth_success;
        debug!(conn_id = self.conn_id, ssh_user = %user, ok, "Password auth (healthcheck surface)");
        self.auth = Some(actx);
        if ok {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: Some(MethodSet::from(
                    [MethodKind::PublicKey].as_slice(),
                )),
                partial_success: false,
            })
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let actx = auth::pubkey_auth(&self.ctx.store, user, public_key).await;
        let ok = actx.auth_success;
        info!(
            conn_id = self.conn_id,
            ssh_user = %user,
            remote = %self.peer_addr,
            user_id = actx.user.id,
            email = %actx.user.email,
            ok,
            "Public key auth resolved"
        );
        self.auth = Some(actx);
        if ok {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(actx) = self.auth.as_ref() else {
            return Ok(false);
        };
        let channel_id = channel.id();

        // Anonymous connections only ever receive their deferred error.
        if actx.user.id == 0 && actx.user_type() != UserType::Healthcheck {
            self.deny_channel(channel);
            return Ok(true);
        }

        match actx.user_type() {
            UserType::Bastion => {
                info!(
                    conn_id = self.conn_id,
                    ssh_user = %actx.input_username,
                    remote = %self.peer_addr,
                    user_id = actx.user.id,
                    email = %actx.user.email,
                    "New bastion channel"
                );
                match build_route(&self.ctx, &actx.user, &actx.input_username).await {
                    Ok(Route::Chain(chain)) => {
                        self.channels.insert(
                            channel_id,
                            ChannelState::PendingChain {
                                channel,
                                chain,
                                term: "xterm".to_string(),
                                cols: 80,
                                rows: 24,
                            },
                        );
                    }
                    Ok(Route::Telnet(host)) => {
                        self.channels.insert(
                            channel_id,
                            ChannelState::PendingTelnet { channel, host },
                        );
                    }
                    Err(e) => self.reject_channel(channel, format!("{e:#}")),
                }
            }
            UserType::Shell if actx.err.is_none() => {
                info!(
                    conn_id = self.conn_id,
                    ssh_user = %actx.input_username,
                    remote = %self.peer_addr,
                    user_id = actx.user.id,
                    "New shell channel"
                );
                let internal_id = self.ctx.store.next_internal_id().await;
                let cancel = self.ctx.registry.add(actx.user.id, internal_id);
                let executor =
                    CommandExecutor::new(self.ctx.clone(), actx.user.clone(), actx.auth_method);
                self.channels.insert(
                    channel_id,
                    ChannelState::Shell(ShellSession::new(executor, internal_id, cancel)),
                );
            }
            _ => {
                self.channels.insert(channel_id, ChannelState::Message);
            }
        }
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(actx) = self.auth.as_ref() else {
            return Ok(false);
        };
        let fingerprint = direct_tcp_fingerprint(
            &actx.input_username,
            &self.peer_addr,
            &self.ctx.config.server.bind_addr,
            actx.user.id,
            &actx.user.email,
        );
        let kind = ChannelKind::DirectTcpip {
            host: host_to_connect.to_string(),
            port: port_to_connect,
            originator: originator_address.to_string(),
            originator_port,
        };

        // A chain resolved within the keepalive window is reused as-is:
        // no second resolution, no second session row.
        if let Some(entry) = self.ctx.cache.get_and_touch(&fingerprint) {
            debug!(
                conn_id = self.conn_id,
                ssh_user = %actx.input_username,
                target = %format!("{host_to_connect}:{port_to_connect}"),
                "direct-tcpip served from chain cache"
            );
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                session::run_chain_session(ctx, channel, entry.chain, entry.user_id, kind, false)
                    .await;
            });
            return Ok(true);
        }

        if actx.user.id == 0 && actx.user_type() != UserType::Healthcheck {
            self.deny_channel(channel);
            return Ok(true);
        }
        if actx.user_type() != UserType::Bastion {
            self.reject_channel(channel, "direct-tcpip requires a bastion target".to_string());
            return Ok(true);
        }

        debug!(
            conn_id = self.conn_id,
            ssh_user = %actx.input_username,
            target = %format!("{host_to_connect}:{port_to_connect}"),
            originator = %format!("{originator_address}:{originator_port}"),
            "direct-tcpip channel open"
        );

        match build_route(&self.ctx, &actx.user, &actx.input_username).await {
            Ok(Route::Chain(chain)) => {
                self.ctx.cache.put(
                    fingerprint,
                    DirectTcpEntry {
                        user_id: actx.user.id,
                        chain: chain.clone(),
                        last_used: Instant::now(),
                    },
                );
                let ctx = self.ctx.clone();
                let user_id = actx.user.id;
                tokio::spawn(async move {
                    session::run_chain_session(ctx, channel, chain, user_id, kind, true).await;
                });
            }
            Ok(Route::Telnet(_)) => {
                self.reject_channel(
                    channel,
                    "unknown bastion scheme for direct-tcpip".to_string(),
                );
            }
            Err(e) => self.reject_channel(channel, format!("{e:#}")),
        }
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(ChannelState::PendingChain {
            term: t,
            cols,
            rows,
            ..
        }) = self.channels.get_mut(&channel)
        {
            *t = term.to_string();
            *cols = col_width;
            *rows = row_height;
        }
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(ChannelState::Shell(shell)) = self.channels.get_mut(&channel) {
            shell.start(session, channel)?;
            return Ok(());
        }
        if matches!(self.channels.get(&channel), Some(ChannelState::Message)) {
            self.respond_message(channel, session);
            return Ok(());
        }
        self.start_proxy(channel, None);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).to_string();
        if let Some(ChannelState::Shell(shell)) = self.channels.get_mut(&channel) {
            // One-shot command, `ssh admin@bastion "session ls"` style.
            shell.handle_input(command.as_bytes(), session, channel).await?;
            shell.handle_input(b"\r", session, channel).await?;
            let _ = session.exit_status_request(channel, 0);
            let _ = session.close(channel);
            return Ok(());
        }
        if matches!(self.channels.get(&channel), Some(ChannelState::Message)) {
            self.respond_message(channel, session);
            return Ok(());
        }
        self.start_proxy(channel, Some(command));
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let mut finished = None;
        if let Some(ChannelState::Shell(shell)) = self.channels.get_mut(&channel) {
            shell.handle_input(data, session, channel).await?;
            if shell.is_closed() {
                finished = Some(shell.internal_id);
            }
        }
        if let Some(internal_id) = finished {
            if let Some(actx) = self.auth.as_ref() {
                self.ctx.registry.del(actx.user.id, internal_id);
            }
            self.channels.remove(&channel);
        }
        Ok(())
    }

    /// SFTP and friends are not part of the bastion surface.
    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        warn!(
            conn_id = self.conn_id,
            subsystem = %name,
            remote = %self.peer_addr,
            "Subsystem denied"
        );
        let _ = session.channel_failure(channel);
        Ok(())
    }
}

impl Drop for SshHandler {
    fn drop(&mut self) {
        // The auth context dies with the connection; registered shell
        // channels must not outlive it in the registry.
        if let Some(actx) = self.auth.as_ref() {
            for state in self.channels.values() {
                if let ChannelState::Shell(shell) = state {
                    self.ctx.registry.del(actx.user.id, shell.internal_id);
                }
            }
        }
    }
}
