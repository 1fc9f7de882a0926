//! Heredoc-based file writes.

const MARKER: &str = "EOFMARKER";

/// Build a shell command that writes `content` to `path` through a quoted heredoc.
///
/// The quoted delimiter disables expansion, so the content is written
/// verbatim. If a line of the content equals the delimiter a numbered one is
/// used instead.
#[must_use]
pub fn heredoc_command(path: &str, content: &str, sudo: bool) -> String {
    let marker = pick_marker(content);
    if sudo {
        format!("sudo tee {path} > /dev/null <<'{marker}'\n{content}\n{marker}")
    } else {
        format!("cat > {path} <<'{marker}'\n{content}\n{marker}")
    }
}

fn pick_marker(content: &str) -> String {
    let collides = |candidate: &str| content.lines().any(|line| line == candidate);

    if !collides(MARKER) {
        return MARKER.to_string();
    }
    (1u32..)
        .map(|n| format!("{MARKER}_{n}"))
        .find(|candidate| !collides(candidate))
        .unwrap_or_else(|| MARKER.to_string())
}
