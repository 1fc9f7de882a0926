//! The sink side of the SCP protocol, just enough to push one file.
//!
//! `scp -t <dir>` answers every record with a single status byte: `0` for
//! success, `1` for a warning and `2` for a fatal error, the latter two
//! followed by a newline-terminated message.

/// File mode sent in the `C` record.
pub const DEFAULT_MODE: u32 = 0o644;

/// Status reported by the remote sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    /// Record accepted.
    Ok,
    /// Non-fatal warning.
    Warning(String),
    /// Fatal error; the transfer is aborted.
    Error(String),
}

/// Build the `C` record announcing a single file.
#[must_use]
pub fn scp_header(mode: u32, len: usize, filename: &str) -> String {
    format!("C{mode:04o} {len} {filename}\n")
}

/// Decode an acknowledgement from the bytes read off the channel.
///
/// Returns `None` if `buf` is empty (the sink closed without answering).
#[must_use]
pub fn parse_ack(buf: &[u8]) -> Option<Ack> {
    let (&code, rest) = buf.split_first()?;
    let message = || {
        String::from_utf8_lossy(rest)
            .trim_end_matches('\n')
            .trim()
            .to_string()
    };
    Some(match code {
        0 => Ack::Ok,
        1 => Ack::Warning(message()),
        _ => Ack::Error(message()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_format() {
        assert_eq!(scp_header(DEFAULT_MODE, 42, "config.txt"), "C0644 42 config.txt\n");
        assert_eq!(scp_header(0o600, 0, "token"), "C0600 0 token\n");
    }

    #[test]
    fn test_parse_ack() {
        assert_eq!(parse_ack(&[0]), Some(Ack::Ok));
        assert_eq!(parse_ack(&[]), None);
        assert_eq!(
            parse_ack(b"\x01scp: warning\n"),
            Some(Ack::Warning("scp: warning".into()))
        );
        assert_eq!(
            parse_ack(b"\x02scp: /boot/firmware: Permission denied\n"),
            Some(Ack::Error("scp: /boot/firmware: Permission denied".into()))
        );
    }
}
