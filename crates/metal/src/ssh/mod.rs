//! SSH transport for node workflows.
//!
//! [`SshClient`] wraps an `ssh2` session: command execution, file transfer
//! (heredoc or SCP sink framing), and the reboot-then-reconnect dance the
//! provisioner relies on.

mod client;
mod heredoc;
mod scp;

use thiserror::Error;

pub use client::{Auth, RebootPolicy, SshClient, DEFAULT_SSH_PORT};
pub use heredoc::heredoc_command;
pub use scp::{parse_ack, scp_header, Ack};

/// Errors that can occur while talking to a node.
#[derive(Error, Debug)]
pub enum SshError {
    /// The SSH port did not accept a TCP connection.
    #[error("cannot reach host {addr}: {source}")]
    Unreachable {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The SSH handshake or connection failed after all attempts.
    #[error("failed to connect to {addr} after {attempts} attempts: {message}")]
    Handshake {
        addr: String,
        attempts: u32,
        message: String,
    },

    /// The server rejected our credentials.
    #[error("authentication failed for {user}@{addr}")]
    Auth { user: String, addr: String },

    /// An operation was attempted before `connect`.
    #[error("not connected")]
    NotConnected,

    /// A remote command exited non-zero.
    #[error("command failed with status {status}: {command}")]
    CommandFailed {
        command: String,
        status: i32,
        output: String,
    },

    /// The SCP sink rejected a transfer.
    #[error("file transfer failed: {0}")]
    Transfer(String),

    /// A remote path was not absolute.
    #[error("path must be absolute: {0}")]
    RelativePath(String),

    /// The host did not come back after a reboot.
    #[error("timed out after {0}s waiting for host to come back from reboot")]
    RebootTimeout(u64),

    /// Local or socket I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// libssh2 failure.
    #[error("ssh error: {0}")]
    Ssh(#[from] ssh2::Error),
}

/// libssh2 session codes raised when the peer goes away: socket send (-7),
/// timeout (-9), socket disconnect (-13), channel closed (-26), channel EOF
/// (-27), socket timeout (-30) and socket receive (-43).
const DISCONNECT_CODES: [i32; 7] = [-7, -9, -13, -26, -27, -30, -43];

impl SshError {
    /// Whether this error means the connection went away underneath us.
    ///
    /// `sudo reboot` usually tears the session down before the exit status
    /// arrives, which surfaces as one of these.
    #[must_use]
    pub fn is_connection_loss(&self) -> bool {
        const MARKERS: [&str; 7] = [
            "connection refused",
            "connection reset",
            "broken pipe",
            "eof",
            "channel closed",
            "session closed",
            "unable to send channel",
        ];

        match self {
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::TimedOut
            ),
            Self::Ssh(e) => matches!(
                e.code(),
                ssh2::ErrorCode::Session(code) if DISCONNECT_CODES.contains(&code)
            ),
            Self::Transfer(message) => {
                let message = message.to_lowercase();
                MARKERS.iter().any(|m| message.contains(m))
            }
            // reboot killed the shell before it could report a real status
            Self::CommandFailed { status, .. } => *status == -1,
            _ => false,
        }
    }

    /// Combined output of a failed command, if any.
    #[must_use]
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::CommandFailed { output, .. } => Some(output),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_connection_loss() {
        let err = SshError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ));
        assert!(err.is_connection_loss());

        let err = SshError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "nope",
        ));
        assert!(!err.is_connection_loss());
    }

    #[test]
    fn test_command_failure_is_not_connection_loss() {
        let err = SshError::CommandFailed {
            command: "sudo reboot".into(),
            status: 1,
            output: "sudo: a password is required".into(),
        };
        assert!(!err.is_connection_loss());
        assert_eq!(err.output(), Some("sudo: a password is required"));
    }

    #[test]
    fn test_ssh_disconnect_codes() {
        let err = SshError::Ssh(ssh2::Error::new(
            ssh2::ErrorCode::Session(-13),
            "socket disconnect",
        ));
        assert!(err.is_connection_loss());
        assert!(SshError::Ssh(ssh2::Error::eof()).is_connection_loss());

        let denied = SshError::Ssh(ssh2::Error::new(
            ssh2::ErrorCode::Session(-22),
            "channel request denied",
        ));
        assert!(!denied.is_connection_loss());
        let failure = SshError::Ssh(ssh2::Error::new(
            ssh2::ErrorCode::Session(-21),
            "unable to open channel",
        ));
        assert!(!failure.is_connection_loss());
    }

    #[test]
    fn test_transfer_eof_is_connection_loss() {
        let err = SshError::Transfer("unexpected EOF from scp sink".into());
        assert!(err.is_connection_loss());
    }
}
