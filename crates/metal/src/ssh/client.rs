//! `ssh2`-backed client.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use base64::Engine;
use sha2::{Digest, Sha256};
use ssh2::{Channel, ExtendedData, HashType, Session};
use tracing::{debug, error, info, warn};

use super::heredoc::heredoc_command;
use super::scp::{parse_ack, scp_header, Ack, DEFAULT_MODE};
use super::SshError;
use crate::remote::{CommandOutput, Remote};
use crate::retry::{with_retry, RetryConfig};

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Timeout for the initial reachability probe.
const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for TCP connect + handshake + auth.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `sudo reboot` may block before we assume the host went down.
const REBOOT_COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

/// How the client authenticates.
#[derive(Clone)]
pub enum Auth {
    /// Password authentication.
    Password(String),
    /// Private key file, optionally encrypted.
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
    /// Keys offered by a running ssh-agent.
    Agent,
}

impl Auth {
    /// Short label for logs.
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            Self::Password(_) => "password",
            Self::KeyFile { .. } => "key",
            Self::Agent => "agent",
        }
    }
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password(p) => f
                .debug_struct("Password")
                .field("length", &p.len())
                .finish(),
            Self::KeyFile { path, passphrase } => f
                .debug_struct("KeyFile")
                .field("path", path)
                .field("passphrase", &passphrase.is_some())
                .finish(),
            Self::Agent => write!(f, "Agent"),
        }
    }
}

/// Timing used while waiting for a node to come back from a reboot.
#[derive(Debug, Clone)]
pub struct RebootPolicy {
    /// Initial wait so we don't reconnect to the host that is still shutting down.
    pub shutdown_grace: Duration,
    /// Wait after the port opens, giving sshd time to finish starting.
    pub settle: Duration,
    /// Sleep between probes.
    pub poll_interval: Duration,
    /// TCP connect timeout for each probe.
    pub probe_timeout: Duration,
}

impl Default for RebootPolicy {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(5),
            settle: Duration::from_secs(2),
            poll_interval: Duration::from_millis(500),
            probe_timeout: Duration::from_secs(1),
        }
    }
}

/// SSH connection to a single node.
pub struct SshClient {
    host: String,
    port: u16,
    user: String,
    auth: Auth,
    retry: RetryConfig,
    reboot_policy: RebootPolicy,
    session: Option<Session>,
}

impl SshClient {
    /// Create a client. Nothing is dialled until [`SshClient::connect`].
    #[must_use]
    pub fn new(host: impl Into<String>, user: impl Into<String>, auth: Auth) -> Self {
        let host = host.into();
        let user = user.into();
        debug!(
            host = %host,
            user = %user,
            auth_method = auth.method(),
            "Creating SSH client"
        );
        Self {
            host,
            port: DEFAULT_SSH_PORT,
            user,
            auth,
            retry: RetryConfig::ssh_connect(),
            reboot_policy: RebootPolicy::default(),
            session: None,
        }
    }

    /// Set the SSH port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Override the connect retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Override reboot wait timing.
    #[must_use]
    pub fn with_reboot_policy(mut self, policy: RebootPolicy) -> Self {
        self.reboot_policy = policy;
        self
    }

    /// `host:port` string.
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// SSH user name.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Whether a session is currently established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Establish the SSH session.
    ///
    /// Checks that the port is reachable first, then attempts the handshake
    /// up to three times.
    ///
    /// # Errors
    /// Returns [`SshError::Unreachable`] if the port is closed, or
    /// [`SshError::Handshake`] once every attempt has failed.
    pub fn connect(&mut self) -> Result<(), SshError> {
        let addr = self.addr();
        let socket = self.socket_addr()?;

        debug!(address = %addr, "Checking network connectivity");
        probe_port(socket, REACHABILITY_TIMEOUT).map_err(|source| {
            error!(address = %addr, error = %source, "Failed to reach host");
            SshError::Unreachable {
                addr: addr.clone(),
                source,
            }
        })?;
        info!(address = %addr, "Host is reachable");

        info!(
            address = %addr,
            user = %self.user,
            timeout = ?CONNECT_TIMEOUT,
            host_key_verification = "disabled",
            "Attempting SSH connection"
        );

        let retry = self.retry.clone();
        let session = with_retry(&retry, "ssh connect", |_| self.open_session(socket))
            .map_err(|e| {
                error!(address = %addr, user = %self.user, error = %e, "SSH connection failed after all attempts");
                match e {
                    SshError::Auth { .. } => e,
                    other => SshError::Handshake {
                        addr: addr.clone(),
                        attempts: retry.max_attempts,
                        message: other.to_string(),
                    },
                }
            })?;

        info!(address = %addr, user = %self.user, "SSH connection successful");
        self.session = Some(session);
        Ok(())
    }

    fn socket_addr(&self) -> Result<SocketAddr, SshError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| SshError::Unreachable {
                addr: self.addr(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "address did not resolve",
                ),
            })
    }

    fn open_session(&self, socket: SocketAddr) -> Result<Session, SshError> {
        let tcp = TcpStream::connect_timeout(&socket, CONNECT_TIMEOUT)?;
        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout(duration_millis(CONNECT_TIMEOUT));
        session.handshake()?;

        // Homelab nodes get reimaged often, so host keys are accepted as-is.
        if let Some(hash) = session.host_key_hash(HashType::Sha256) {
            let fingerprint = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
            let key_type = session
                .host_key()
                .map(|(_, kind)| format!("{kind:?}"))
                .unwrap_or_default();
            debug!(
                hostname = %self.host,
                key_type = %key_type,
                fingerprint = %format!("SHA256:{fingerprint}"),
                "Accepting host key"
            );
        }

        match &self.auth {
            Auth::Password(password) => session.userauth_password(&self.user, password),
            Auth::KeyFile { path, passphrase } => session.userauth_pubkey_file(
                &self.user,
                None,
                path,
                passphrase.as_deref(),
            ),
            Auth::Agent => session.userauth_agent(&self.user),
        }
        .map_err(|e| {
            warn!(user = %self.user, error = %e, "SSH authentication rejected");
            SshError::Auth {
                user: self.user.clone(),
                addr: self.addr(),
            }
        })?;

        if !session.authenticated() {
            return Err(SshError::Auth {
                user: self.user.clone(),
                addr: self.addr(),
            });
        }

        // Installs can run for minutes; only the connect phase is bounded.
        session.set_timeout(0);
        Ok(session)
    }

    fn session(&self) -> Result<&Session, SshError> {
        self.session.as_ref().ok_or(SshError::NotConnected)
    }

    fn run(&self, command: &str) -> Result<CommandOutput, SshError> {
        let mut channel = self.session()?.channel_session()?;
        channel.handle_extended_data(ExtendedData::Merge)?;
        channel.exec(command)?;

        let mut raw = Vec::new();
        channel.read_to_end(&mut raw)?;
        let output = decode_output(raw);
        channel.wait_close()?;
        let exit_status = channel.exit_status()?;

        if exit_status != 0 {
            error!(
                command = %redact(command),
                status = exit_status,
                output = %output,
                "Command execution failed"
            );
            return Err(SshError::CommandFailed {
                command: redact(command),
                status: exit_status,
                output,
            });
        }

        Ok(CommandOutput {
            output,
            exit_status,
        })
    }

    /// Copy `content` to the absolute `path` using the SCP sink protocol.
    ///
    /// Runs `sudo /usr/bin/scp -t <dir>` and frames the file by hand, so
    /// binary content and root-owned destinations both work.
    ///
    /// # Errors
    /// Returns an error if the path is relative, the sink rejects the file,
    /// or the channel fails.
    pub fn upload(&mut self, content: &[u8], path: &str) -> Result<(), SshError> {
        let remote = Path::new(path);
        if !remote.is_absolute() {
            return Err(SshError::RelativePath(path.to_string()));
        }
        let dir = remote
            .parent()
            .map_or_else(|| "/".to_string(), |p| p.display().to_string());
        let filename = remote
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .ok_or_else(|| SshError::RelativePath(path.to_string()))?;

        debug!(path = %path, bytes = content.len(), "Uploading file via scp");

        let mut channel = self.session()?.channel_session()?;
        channel.exec(&format!("sudo /usr/bin/scp -t {dir}"))?;

        read_ack(&mut channel)?;
        channel.write_all(scp_header(DEFAULT_MODE, content.len(), &filename).as_bytes())?;
        read_ack(&mut channel)?;
        channel.write_all(content)?;
        channel.write_all(&[0])?;
        read_ack(&mut channel)?;

        channel.send_eof()?;
        channel.wait_eof()?;
        channel.wait_close()?;

        let status = channel.exit_status()?;
        if status != 0 {
            return Err(SshError::Transfer(format!(
                "scp exited with status {status} writing {path}"
            )));
        }
        Ok(())
    }

    /// Upload `content` to `/tmp/<sha256>` and return the remote path.
    ///
    /// # Errors
    /// Returns an error if the upload fails.
    pub fn upload_temp(&mut self, content: &[u8]) -> Result<String, SshError> {
        let path = temp_path(content);
        self.upload(content, &path)?;
        Ok(path)
    }

    /// Disconnect the session. Safe to call more than once.
    ///
    /// # Errors
    /// Returns an error if the disconnect message cannot be sent.
    pub fn close(&mut self) -> Result<(), SshError> {
        if let Some(session) = self.session.take() {
            session.disconnect(None, "closing", None)?;
        }
        Ok(())
    }

    /// Check that the host answers and accepts a trivial command.
    fn verify(&self) -> Result<(), SshError> {
        self.run("true").map(|_| ())
    }
}

impl Remote for SshClient {
    fn address(&self) -> &str {
        &self.host
    }

    fn execute(&mut self, command: &str) -> Result<CommandOutput, SshError> {
        self.run(command)
    }

    fn write_file(&mut self, path: &str, content: &str, sudo: bool) -> Result<(), SshError> {
        self.run(&heredoc_command(path, content, sudo))
            .map(|_| ())
            .inspect_err(|e| {
                error!(path = %path, error = %e, output = e.output().unwrap_or_default(), "Failed to write file");
            })
    }

    fn read_file(&mut self, path: &str, sudo: bool) -> Result<String, SshError> {
        let command = if sudo {
            format!("sudo cat {path}")
        } else {
            format!("cat {path}")
        };
        self.run(&command).map(|out| out.output)
    }

    fn reboot(&mut self) -> Result<(), SshError> {
        if let Some(session) = &self.session {
            session.set_timeout(duration_millis(REBOOT_COMMAND_TIMEOUT));
        }
        let result = self.execute_sudo("reboot");
        // The session dies with the host either way.
        self.session = None;

        reboot_outcome(result)
    }

    fn wait_for_reboot(&mut self, timeout: Duration) -> Result<(), SshError> {
        let deadline = Instant::now() + timeout;
        let socket = self.socket_addr()?;
        let policy = self.reboot_policy.clone();

        std::thread::sleep(policy.shutdown_grace);

        while Instant::now() < deadline {
            if probe_port(socket, policy.probe_timeout).is_ok() {
                std::thread::sleep(policy.settle);

                match self.connect().and_then(|()| self.verify()) {
                    Ok(()) => {
                        info!(address = %self.addr(), "Host is back online");
                        return Ok(());
                    }
                    Err(e) => {
                        debug!(error = %e, "Host reachable but SSH not ready yet");
                        self.session = None;
                    }
                }
            }
            std::thread::sleep(policy.poll_interval);
        }

        Err(SshError::RebootTimeout(timeout.as_secs()))
    }
}

impl Drop for SshClient {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Command output as text. Invalid UTF-8 (binary files, odd locales) is
/// replaced rather than rejected.
fn decode_output(raw: Vec<u8>) -> String {
    String::from_utf8(raw).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}

/// A reboot succeeded if the command returned or the connection dropped.
/// Any other failure means the host may never have received it.
fn reboot_outcome(result: Result<CommandOutput, SshError>) -> Result<(), SshError> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_connection_loss() => {
            debug!(error = %e, "Connection dropped after reboot command (expected)");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Open (and immediately drop) a TCP connection to `addr`.
///
/// # Errors
/// Returns the connect error if the port does not accept within `timeout`.
pub fn probe_port(addr: SocketAddr, timeout: Duration) -> std::io::Result<()> {
    TcpStream::connect_timeout(&addr, timeout).map(drop)
}

/// Remote temp path derived from the content hash.
#[must_use]
pub fn temp_path(content: &[u8]) -> String {
    format!("/tmp/{}", hex::encode(Sha256::digest(content)))
}

fn read_ack(channel: &mut Channel) -> Result<(), SshError> {
    let mut code = [0u8; 1];
    if channel.read(&mut code)? == 0 {
        return Err(SshError::Transfer("unexpected EOF from scp sink".into()));
    }
    if code[0] == 0 {
        return Ok(());
    }

    let mut message = vec![code[0]];
    let mut byte = [0u8; 1];
    while channel.read(&mut byte)? == 1 {
        message.push(byte[0]);
        if byte[0] == b'\n' {
            break;
        }
    }

    match parse_ack(&message) {
        Some(Ack::Ok) => Ok(()),
        Some(Ack::Warning(msg)) => {
            warn!(message = %msg, "scp sink warning");
            Ok(())
        }
        Some(Ack::Error(msg)) => Err(SshError::Transfer(msg)),
        None => Err(SshError::Transfer("empty acknowledgement".into())),
    }
}

fn duration_millis(d: Duration) -> u32 {
    u32::try_from(d.as_millis()).unwrap_or(u32::MAX)
}

/// Hide the value following `--token` so join commands can be logged.
fn redact(command: &str) -> String {
    let mut redacted = Vec::new();
    let mut hide_next = false;
    for word in command.split(' ') {
        if hide_next {
            redacted.push("<redacted>");
            hide_next = false;
            continue;
        }
        hide_next = word == "--token";
        redacted.push(word);
    }
    redacted.join(" ")
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn test_decode_output_tolerates_invalid_utf8() {
        assert_eq!(decode_output(b"Linux pi-0\n".to_vec()), "Linux pi-0\n");
        assert_eq!(decode_output(vec![b'o', b'k', 0xff, b'\n']), "ok\u{fffd}\n");
    }

    #[test]
    fn test_reboot_outcome() {
        assert!(reboot_outcome(Err(SshError::Ssh(ssh2::Error::eof()))).is_ok());
        assert!(reboot_outcome(Err(SshError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ))))
        .is_ok());

        let err = reboot_outcome(Err(SshError::Ssh(ssh2::Error::new(
            ssh2::ErrorCode::Session(-21),
            "unable to open channel",
        ))))
        .unwrap_err();
        assert!(matches!(err, SshError::Ssh(_)));

        let err = reboot_outcome(Err(SshError::CommandFailed {
            command: "sudo reboot".into(),
            status: 1,
            output: "sudo: a password is required".into(),
        }))
        .unwrap_err();
        assert_eq!(err.output(), Some("sudo: a password is required"));
    }

    #[test]
    fn test_temp_path_is_content_addressed() {
        let a = temp_path(b"BOOT_ORDER=0xf416");
        let b = temp_path(b"BOOT_ORDER=0xf416");
        let c = temp_path(b"BOOT_ORDER=0xf41");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("/tmp/"));
        assert_eq!(a.len(), "/tmp/".len() + 64);
    }

    #[test]
    fn test_redact_token() {
        let cmd = "curl -sfL https://get.k3s.io | sh -s - server --server https://10.0.0.1:6443 --token K10abc::server:xyz";
        let redacted = redact(cmd);
        assert!(!redacted.contains("K10abc"));
        assert!(redacted.ends_with("--token <redacted>"));
        assert_eq!(redact("sudo cat /etc/hosts"), "sudo cat /etc/hosts");
    }

    #[test]
    fn test_probe_port_open_and_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(probe_port(addr, Duration::from_secs(1)).is_ok());

        drop(listener);
        assert!(probe_port(addr, Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_connect_unreachable() {
        // Grab a free port, then release it so nothing is listening.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut client =
            SshClient::new("127.0.0.1", "pi", Auth::Password("secret".into())).with_port(port);
        let err = client.connect().unwrap_err();
        assert!(matches!(err, SshError::Unreachable { .. }));
        assert!(!client.is_connected());
    }

    #[test]
    fn test_operations_require_connection() {
        let mut client = SshClient::new("127.0.0.1", "pi", Auth::Agent);
        assert!(matches!(
            client.execute("true").unwrap_err(),
            SshError::NotConnected
        ));
        assert!(matches!(
            client.upload(b"x", "relative/path").unwrap_err(),
            SshError::RelativePath(_)
        ));
    }

    #[test]
    fn test_wait_for_reboot_times_out() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut client = SshClient::new("127.0.0.1", "pi", Auth::Agent)
            .with_port(port)
            .with_reboot_policy(RebootPolicy {
                shutdown_grace: Duration::ZERO,
                settle: Duration::ZERO,
                poll_interval: Duration::from_millis(10),
                probe_timeout: Duration::from_millis(10),
            });
        let err = client
            .wait_for_reboot(Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, SshError::RebootTimeout(_)));
    }

    #[test]
    fn test_auth_debug_hides_password() {
        let auth = Auth::Password("hunter2".into());
        let debug = format!("{auth:?}");
        assert!(!debug.contains("hunter2"));
        assert_eq!(auth.method(), "password");
    }
}
