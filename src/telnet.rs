//! Telnet adaptor: targets whose scheme is `telnet` get a plain TCP pump
//! instead of an SSH hop chain.

use std::sync::Arc;

use russh::Channel;
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::context::AppContext;
use crate::session::{pump, reply_error};
use crate::store::models::{Host, Id, LoggingMode};

/// Bridge an inbound session channel to a telnet target. The session row
/// lifecycle matches the SSH path: created active before the dial, closed
/// with the error (if any) before deregistration.
pub async fn run_telnet_session(
    ctx: Arc<AppContext>,
    channel: Channel<russh::server::Msg>,
    host: Host,
    user_id: Id,
) {
    let row = ctx.store.create_session(user_id, host.id).await;
    let cancel = ctx.registry.add(user_id, row.id);

    info!(user_id, host = %host.name, session_id = row.id, "Telnet session starting");

    let result = match TcpStream::connect(&host.addr).await {
        Ok(stream) => {
            pump(
                channel.into_stream(),
                stream,
                None,
                LoggingMode::Disabled,
                cancel.clone(),
            )
            .await
        }
        Err(e) => {
            let err = anyhow::Error::new(e).context(format!("dialing {}", host.addr));
            reply_error(&channel, &format!("{err:#}")).await;
            Err(err)
        }
    };

    let err_msg = result.as_ref().err().map(|e| format!("{e:#}"));
    if let Err(e) = ctx.store.close_session(row.id, err_msg).await {
        warn!(session_id = row.id, error = %e, "Failed to close session row");
    }
    ctx.registry.del(user_id, row.id);

    match result {
        Ok((bytes_up, bytes_down)) => {
            info!(user_id, host = %host.name, bytes_up, bytes_down, "Telnet session closed")
        }
        Err(e) => info!(user_id, host = %host.name, error = %format!("{e:#}"), "Telnet session failed"),
    }
}
