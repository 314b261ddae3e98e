use std::fs::File;
use std::io::Write;
use std::process::{Command, Stdio};

use tracing::{debug, info};

use super::compose::OutboundMessage;
use super::error::{ComposeError, TransportError};

/// Hands a composed message to whatever delivers mail.
pub trait MailTransport: Send + Sync {
    fn send(&self, message: &OutboundMessage) -> Result<(), TransportError>;
}

/// Pipes the rendered message into a sendmail-compatible command.
#[derive(Debug, Clone)]
pub struct SendmailTransport {
    command: String,
}

impl SendmailTransport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl Default for SendmailTransport {
    fn default() -> Self {
        Self::new("msmtp -t")
    }
}

impl MailTransport for SendmailTransport {
    fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let mut parts = self.command.split_whitespace();
        let program = parts.next().ok_or(TransportError::EmptyCommand)?;
        let spawn_err = |source| TransportError::Spawn {
            command: self.command.clone(),
            source,
        };

        let rendered = message.render()?;

        // Written to a file first so the command gets a seekable stdin
        let mut temp_file = tempfile::NamedTempFile::new().map_err(ComposeError::Render)?;
        temp_file.write_all(&rendered).map_err(ComposeError::Render)?;
        temp_file.flush().map_err(ComposeError::Render)?;

        debug!(command = %self.command, identity = %message.identity, "sending");
        let output = Command::new(program)
            .args(parts)
            .stdin(File::open(temp_file.path()).map_err(spawn_err)?)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(spawn_err)?;

        if !output.status.success() {
            return Err(TransportError::Rejected {
                command: self.command.clone(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!(identity = %message.identity, to = %message.to.address, "message sent");
        Ok(())
    }
}
