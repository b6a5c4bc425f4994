pub mod commands;

use anyhow::Result;
use russh::server::Session;
use russh::{ChannelId, CryptoVec};
use tokio_util::sync::CancellationToken;

use crate::store::models::Id;
use commands::CommandExecutor;

/// An administrative shell attached to one SSH channel.
///
/// The `Channel` handed over in `channel_open_session` is intentionally
/// NOT kept: russh buffers every incoming message into the Channel's
/// bounded mpsc before invoking the Handler callback, and an undrained
/// buffer wedges the whole connection event loop. All writes go through
/// `Session::data` instead.
pub struct ShellSession {
    executor: CommandExecutor,
    line: Vec<u8>,
    closed: bool,
    /// Registered id for administrative disconnect of this shell.
    pub internal_id: Id,
    cancel: CancellationToken,
}

impl ShellSession {
    pub fn new(executor: CommandExecutor, internal_id: Id, cancel: CancellationToken) -> Self {
        Self {
            executor,
            line: Vec::new(),
            closed: false,
            internal_id,
            cancel,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Send the greeting and first prompt.
    pub fn start(&mut self, session: &mut Session, channel: ChannelId) -> Result<()> {
        let banner = format!(
            "sshgate {} — type 'help' for commands\r\n",
            env!("CARGO_PKG_VERSION")
        );
        let _ = session.data(channel, CryptoVec::from_slice(banner.as_bytes()));
        self.send_prompt(session, channel);
        Ok(())
    }

    fn send_prompt(&self, session: &mut Session, channel: ChannelId) {
        let prompt = self.executor.prompt();
        let _ = session.data(channel, CryptoVec::from_slice(prompt.as_bytes()));
    }

    /// Feed raw client bytes through the line discipline, executing each
    /// completed line.
    pub async fn handle_input(
        &mut self,
        data: &[u8],
        session: &mut Session,
        channel: ChannelId,
    ) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if self.cancel.is_cancelled() {
            let _ = session.data(
                channel,
                CryptoVec::from_slice(b"\r\nclosed by administrator\r\n"),
            );
            let _ = session.close(channel);
            self.closed = true;
            return Ok(());
        }

        for &byte in data {
            match byte {
                b'\r' | b'\n' => {
                    let _ = session.data(channel, CryptoVec::from_slice(b"\r\n"));
                    let line = String::from_utf8_lossy(&self.line).to_string();
                    self.line.clear();

                    let result = self.executor.execute(&line).await;
                    if !result.output.is_empty() {
                        let _ =
                            session.data(channel, CryptoVec::from_slice(result.output.as_bytes()));
                    }
                    if result.exit {
                        self.closed = true;
                        let _ = session.exit_status_request(channel, 0);
                        let _ = session.close(channel);
                        return Ok(());
                    }
                    self.send_prompt(session, channel);
                }
                0x7f | 0x08 => {
                    if self.line.pop().is_some() {
                        let _ = session.data(channel, CryptoVec::from_slice(b"\x08 \x08"));
                    }
                }
                // Ctrl-C drops the current line
                0x03 => {
                    self.line.clear();
                    let _ = session.data(channel, CryptoVec::from_slice(b"^C\r\n"));
                    self.send_prompt(session, channel);
                }
                // Ctrl-D on an empty line closes the shell
                0x04 => {
                    if self.line.is_empty() {
                        self.closed = true;
                        let _ = session.exit_status_request(channel, 0);
                        let _ = session.close(channel);
                        return Ok(());
                    }
                }
                0x20..=0x7e => {
                    self.line.push(byte);
                    let _ = session.data(channel, CryptoVec::from_slice(&[byte]));
                }
                _ => {}
            }
        }
        Ok(())
    }
}
