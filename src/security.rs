#![forbid(unsafe_code)]

use anyhow::{Result, bail};
use nix::unistd::Uid;
use tracing::warn;

/// Refuses to start as root unless the operator opted in (typically inside a
/// container, where uid 0 is the norm). yt-dlp runs with the server's
/// privileges on attacker-chosen URLs.
pub fn ensure_not_root(process: &str, allow_root: bool) -> Result<()> {
    ensure_not_root_for(Uid::current(), process, allow_root)
}

fn ensure_not_root_for(uid: Uid, process: &str, allow_root: bool) -> Result<()> {
    if !uid.is_root() {
        return Ok(());
    }
    if allow_root {
        warn!("{process} is running as root because TUBEGRAB_ALLOW_ROOT is set");
        return Ok(());
    }
    bail!(
        "{process} must not be run as root; use a regular user or set TUBEGRAB_ALLOW_ROOT=1"
    );
}
