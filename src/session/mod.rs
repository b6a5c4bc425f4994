pub mod cache;
pub mod hostkey;
pub mod recorder;
pub mod registry;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use russh::client::{self, AuthResult};
use russh::keys::{decode_secret_key, PrivateKeyWithHashAlg};
use russh::{Channel, Disconnect};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::acl;
use crate::context::AppContext;
use crate::session::hostkey::HopVerifier;
use crate::session::recorder::{records_direction, TranscriptRecorder};
use crate::store::models::{AclAction, Host, Id, LoggingMode, User};

/// Hop chains longer than this fail resolution; guards against cycles the
/// cycle check itself cannot see (e.g. freshly re-created hosts).
pub const MAX_HOP_DEPTH: usize = 16;

const PUMP_BUFFER_SIZE: usize = 8192;

/// Credential used to authenticate against one hop.
#[derive(Clone)]
pub enum HopAuth {
    Password(String),
    /// PEM private key.
    PrivateKey(String),
}

/// Everything needed to dial and authenticate one hop.
/// Chains are ordered origin-first; the last entry is the terminal host.
#[derive(Clone)]
pub struct SessionConfig {
    pub host_id: Id,
    pub host_name: String,
    pub addr: String,
    pub username: String,
    pub auth: HopAuth,
    pub logging: LoggingMode,
}

/// What the inbound channel asked for, replayed against the terminal hop.
#[derive(Debug, Clone)]
pub enum ChannelKind {
    Shell {
        term: String,
        cols: u32,
        rows: u32,
    },
    Exec {
        command: String,
    },
    DirectTcpip {
        host: String,
        port: u32,
        originator: String,
        originator_port: u32,
    },
}

/// Transport selected for a target host.
pub enum Route {
    Chain(Vec<SessionConfig>),
    Telnet(Host),
}

/// Resolve a target host name into its transport route.
pub async fn build_route(ctx: &AppContext, user: &User, target: &str) -> Result<Route> {
    let host = ctx
        .store
        .host_by_name(target)
        .await
        .ok_or_else(|| anyhow!("unknown host: {target}"))?;
    match host.scheme.as_str() {
        "ssh" => Ok(Route::Chain(build_chain(ctx, user, host).await?)),
        "telnet" => Ok(Route::Telnet(host)),
        other => anyhow::bail!("unknown bastion scheme: {other:?}"),
    }
}

/// Walk the hop relation from the terminal host back to an origin,
/// producing the ordered chain [origin … terminal]. Every hop is ACL
/// checked; a deny anywhere fails the whole chain.
pub async fn build_chain(
    ctx: &AppContext,
    user: &User,
    terminal: Host,
) -> Result<Vec<SessionConfig>> {
    let acls = ctx.store.acls().await;
    let check_cmd = ctx.config.security.acl_check_cmd.as_deref();

    let mut chain: Vec<SessionConfig> = Vec::new();
    let mut seen: HashSet<Id> = HashSet::new();
    let mut current = Some(terminal);

    while let Some(host) = current {
        if chain.len() >= MAX_HOP_DEPTH {
            anyhow::bail!("hop chain exceeds {MAX_HOP_DEPTH} hosts");
        }
        if !seen.insert(host.id) {
            anyhow::bail!("hop cycle detected at host {:?}", host.name);
        }

        let config = hop_config(ctx, user, &host, &acls, check_cmd).await?;
        chain.insert(0, config);

        current = match host.hop_id {
            Some(hop_id) => Some(
                ctx.store
                    .host_by_id(hop_id)
                    .await
                    .ok_or_else(|| anyhow!("hop of {:?} points to a missing host", host.name))?,
            ),
            None => None,
        };
    }
    Ok(chain)
}

async fn hop_config(
    ctx: &AppContext,
    user: &User,
    host: &Host,
    acls: &[crate::store::models::Acl],
    check_cmd: Option<&str>,
) -> Result<SessionConfig> {
    match acl::evaluate(user, host, acls, check_cmd).await? {
        AclAction::Allow => {}
        AclAction::Deny => anyhow::bail!("you don't have permission to that host"),
    }

    let auth = if let Some(sealed) = &host.password {
        let password = ctx
            .vault
            .open(sealed)
            .map_err(|e| anyhow!("unsealing password for {:?}: {e}", host.name))?;
        HopAuth::Password(password)
    } else if let Some(key_id) = host.ssh_key_id {
        let key = ctx
            .store
            .ssh_key_by_id(key_id)
            .await
            .ok_or_else(|| anyhow!("ssh key {key_id} of {:?} is missing", host.name))?;
        let pem = ctx
            .vault
            .open(&key.priv_key)
            .map_err(|e| anyhow!("unsealing key for {:?}: {e}", host.name))?;
        HopAuth::PrivateKey(pem)
    } else {
        anyhow::bail!("no credential configured for host {:?}", host.name);
    };

    Ok(SessionConfig {
        host_id: host.id,
        host_name: host.name.clone(),
        addr: host.addr.clone(),
        username: host.username.clone(),
        auth,
        logging: host.logging,
    })
}

/// Drive one proxied connection end to end: dial the chain, then persist
/// the session row, register the connection, pump, and close the row
/// before deregistering and tearing the upstream down.
///
/// Rejected dials (host-key mismatch included) surface as channel text
/// and never create a row; only a connection that is about to forward
/// bytes gets one. `record_row` is false only for direct-tcpip opens
/// served from the chain cache, which do not get their own session row.
pub async fn run_chain_session(
    ctx: Arc<AppContext>,
    channel: Channel<russh::server::Msg>,
    chain: Vec<SessionConfig>,
    user_id: Id,
    kind: ChannelKind,
    record_row: bool,
) {
    let Some(terminal) = chain.last().cloned() else {
        reply_error(&channel, "empty hop chain").await;
        return;
    };

    info!(
        user_id,
        host = %terminal.host_name,
        hops = chain.len(),
        kind = ?kind,
        "Session starting"
    );

    let mut handles: Vec<client::Handle<HopVerifier>> = Vec::new();
    let setup = async {
        let mut connected = connect_chain(&ctx, &chain).await?;
        let terminal_handle = connected.last_mut().expect("chain is non-empty");
        let upstream = open_terminal_channel(terminal_handle, &kind).await?;
        Ok::<_, anyhow::Error>((connected, upstream))
    }
    .await;

    let result = match setup {
        Err(e) => {
            reply_error(&channel, &format!("{e:#}")).await;
            Err(e)
        }
        Ok((connected, upstream)) => {
            handles = connected;

            // Row first, registration second, bytes last.
            let row = if record_row {
                Some(ctx.store.create_session(user_id, terminal.host_id).await)
            } else {
                None
            };
            let cancel = row
                .as_ref()
                .map(|s| ctx.registry.add(user_id, s.id))
                .unwrap_or_default();

            let recorder = match &row {
                Some(s) if terminal.logging != LoggingMode::Disabled => {
                    match TranscriptRecorder::create(
                        &ctx.config.server.logs_location,
                        s.id,
                        &terminal.host_name,
                    )
                    .await
                    {
                        Ok(rec) => Some(Arc::new(rec)),
                        Err(e) => {
                            warn!(error = %e, "Transcript unavailable, continuing unrecorded");
                            None
                        }
                    }
                }
                _ => None,
            };

            let totals = pump(
                channel.into_stream(),
                upstream.into_stream(),
                recorder,
                terminal.logging,
                cancel,
            )
            .await;

            // The row is closed before deregistration and before the
            // upstream teardown below.
            if let Some(ref s) = row {
                let err_msg = totals.as_ref().err().map(|e| format!("{e:#}"));
                if let Err(e) = ctx.store.close_session(s.id, err_msg).await {
                    warn!(session_id = s.id, error = %e, "Failed to close session row");
                }
                ctx.registry.del(user_id, s.id);
            }
            totals
        }
    };

    for handle in handles.iter_mut().rev() {
        let _ = handle
            .disconnect(Disconnect::ByApplication, "session closed", "en")
            .await;
    }

    match &result {
        Ok((bytes_up, bytes_down)) => info!(
            user_id,
            host = %terminal.host_name,
            bytes_up,
            bytes_down,
            "Session closed"
        ),
        Err(e) => info!(user_id, host = %terminal.host_name, error = %format!("{e:#}"), "Session failed"),
    }
}

/// Dial the chain in order: TCP to the first hop, then each further hop
/// nested through a direct-tcpip channel of the previous one.
async fn connect_chain(
    ctx: &AppContext,
    chain: &[SessionConfig],
) -> Result<Vec<client::Handle<HopVerifier>>> {
    let mut handles = Vec::with_capacity(chain.len());
    let mut tunnel: Option<russh::ChannelStream<client::Msg>> = None;

    for (i, hop) in chain.iter().enumerate() {
        let config = Arc::new(client::Config::default());
        let verifier = HopVerifier::new(ctx.store.clone(), hop.host_id, hop.host_name.clone());

        let mut handle = match tunnel.take() {
            None => client::connect(config, hop.addr.as_str(), verifier)
                .await
                .with_context(|| format!("dialing {}", hop.addr))?,
            Some(stream) => client::connect_stream(config, stream, verifier)
                .await
                .with_context(|| format!("connecting through tunnel to {}", hop.addr))?,
        };

        authenticate_hop(&mut handle, hop).await?;

        if i + 1 < chain.len() {
            let next = &chain[i + 1];
            let (next_host, next_port) = split_addr(&next.addr)?;
            let channel = handle
                .channel_open_direct_tcpip(next_host, u32::from(next_port), "127.0.0.1", 0)
                .await
                .with_context(|| format!("opening tunnel to {}", next.addr))?;
            tunnel = Some(channel.into_stream());
        }
        handles.push(handle);
    }
    Ok(handles)
}

async fn authenticate_hop(
    handle: &mut client::Handle<HopVerifier>,
    hop: &SessionConfig,
) -> Result<()> {
    let auth_result = match &hop.auth {
        HopAuth::Password(password) => handle
            .authenticate_password(&hop.username, password)
            .await
            .with_context(|| format!("authenticating to {}", hop.host_name))?,
        HopAuth::PrivateKey(pem) => {
            let key = decode_secret_key(pem, None)
                .map_err(|e| anyhow!("decoding key for {}: {e}", hop.host_name))?;
            let key = PrivateKeyWithHashAlg::new(Arc::new(key), None);
            handle
                .authenticate_publickey(&hop.username, key)
                .await
                .with_context(|| format!("authenticating to {}", hop.host_name))?
        }
    };

    match auth_result {
        AuthResult::Success => Ok(()),
        AuthResult::Failure { .. } => {
            anyhow::bail!("authentication rejected by {}", hop.host_name)
        }
    }
}

async fn open_terminal_channel(
    handle: &mut client::Handle<HopVerifier>,
    kind: &ChannelKind,
) -> Result<Channel<client::Msg>> {
    match kind {
        ChannelKind::Shell { term, cols, rows } => {
            let channel = handle
                .channel_open_session()
                .await
                .context("opening session channel upstream")?;
            channel
                .request_pty(false, term, *cols, *rows, 0, 0, &[])
                .await
                .context("requesting pty upstream")?;
            channel
                .request_shell(false)
                .await
                .context("starting shell upstream")?;
            Ok(channel)
        }
        ChannelKind::Exec { command } => {
            let channel = handle
                .channel_open_session()
                .await
                .context("opening session channel upstream")?;
            channel
                .exec(false, command.as_bytes())
                .await
                .context("starting command upstream")?;
            Ok(channel)
        }
        ChannelKind::DirectTcpip {
            host,
            port,
            originator,
            originator_port,
        } => handle
            .channel_open_direct_tcpip(host.as_str(), *port, originator.as_str(), *originator_port)
            .await
            .context("opening forward upstream"),
    }
}

/// Bidirectional copy between the inbound channel and the terminal hop.
/// Either side finishing, or a cancel from the connection registry,
/// unblocks the other direction.
pub async fn pump<A, B>(
    client_stream: A,
    upstream: B,
    recorder: Option<Arc<TranscriptRecorder>>,
    mode: LoggingMode,
    cancel: CancellationToken,
) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (client_read, client_write) = tokio::io::split(client_stream);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let stop = cancel.child_token();
    let record_in = recorder.clone().filter(|_| records_direction(mode, true));
    let record_out = recorder.filter(|_| records_direction(mode, false));

    let up = async {
        let n = pump_one(client_read, upstream_write, record_in, &stop).await;
        stop.cancel();
        n
    };
    let down = async {
        let n = pump_one(upstream_read, client_write, record_out, &stop).await;
        stop.cancel();
        n
    };

    let (bytes_up, bytes_down) = tokio::join!(up, down);
    Ok((bytes_up, bytes_down))
}

async fn pump_one<R, W>(
    mut reader: R,
    mut writer: W,
    recorder: Option<Arc<TranscriptRecorder>>,
    stop: &CancellationToken,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            res = reader.read(&mut buf) => match res {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if writer.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                    if let Some(ref rec) = recorder {
                        rec.record(&buf[..n]).await;
                    }
                    total += n as u64;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
    total
}

/// Write an error line on an accepted channel, then close it. All
/// user-visible failures travel this way rather than through the SSH
/// handshake.
pub async fn reply_error(channel: &Channel<russh::server::Msg>, msg: &str) {
    let text = format!("error: {msg}\n");
    let _ = channel.data(text.as_bytes()).await;
    let _ = channel.eof().await;
    let _ = channel.close().await;
}

fn split_addr(addr: &str) -> Result<(&str, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("invalid dial address {addr:?} (expected host:port)"))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid port in {addr:?}"))?;
    Ok((host, port))
}
