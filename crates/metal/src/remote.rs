//! The command-execution seam between node workflows and the transport.
//!
//! Provisioning and K3s installation only need a handful of remote
//! primitives. Keeping them behind a trait lets those workflows run against
//! an in-memory fake in tests.

use std::time::Duration;

use crate::ssh::SshError;

/// Output of a remote command with stdout and stderr merged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Combined output.
    pub output: String,
    /// Exit status reported by the remote shell.
    pub exit_status: i32,
}

impl CommandOutput {
    /// Output with surrounding whitespace removed.
    #[must_use]
    pub fn trimmed(&self) -> &str {
        self.output.trim()
    }
}

/// Remote primitives used by node workflows.
pub trait Remote {
    /// Address of the remote host (as used for connecting).
    fn address(&self) -> &str;

    /// Run a command.
    ///
    /// # Errors
    /// Returns an error if the command cannot be started or exits non-zero.
    fn execute(&mut self, command: &str) -> Result<CommandOutput, SshError>;

    /// Run a command under `sudo`.
    ///
    /// # Errors
    /// Returns an error if the command cannot be started or exits non-zero.
    fn execute_sudo(&mut self, command: &str) -> Result<CommandOutput, SshError> {
        self.execute(&format!("sudo {command}"))
    }

    /// Write `content` to `path`, optionally through `sudo`.
    ///
    /// # Errors
    /// Returns an error if the remote write fails.
    fn write_file(&mut self, path: &str, content: &str, sudo: bool) -> Result<(), SshError>;

    /// Read the file at `path`, optionally through `sudo`.
    ///
    /// # Errors
    /// Returns an error if the remote read fails.
    fn read_file(&mut self, path: &str, sudo: bool) -> Result<String, SshError>;

    /// Ask the host to reboot. Losing the connection is not an error.
    ///
    /// # Errors
    /// Returns an error if the reboot command is rejected.
    fn reboot(&mut self) -> Result<(), SshError>;

    /// Block until the host accepts SSH again or `timeout` elapses.
    ///
    /// # Errors
    /// Returns [`SshError::RebootTimeout`] when the host does not return in time.
    fn wait_for_reboot(&mut self, timeout: Duration) -> Result<(), SshError>;
}

impl<R: Remote + ?Sized> Remote for &mut R {
    fn address(&self) -> &str {
        (**self).address()
    }

    fn execute(&mut self, command: &str) -> Result<CommandOutput, SshError> {
        (**self).execute(command)
    }

    fn execute_sudo(&mut self, command: &str) -> Result<CommandOutput, SshError> {
        (**self).execute_sudo(command)
    }

    fn write_file(&mut self, path: &str, content: &str, sudo: bool) -> Result<(), SshError> {
        (**self).write_file(path, content, sudo)
    }

    fn read_file(&mut self, path: &str, sudo: bool) -> Result<String, SshError> {
        (**self).read_file(path, sudo)
    }

    fn reboot(&mut self) -> Result<(), SshError> {
        (**self).reboot()
    }

    fn wait_for_reboot(&mut self, timeout: Duration) -> Result<(), SshError> {
        (**self).wait_for_reboot(timeout)
    }
}
