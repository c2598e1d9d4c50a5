//! PID file guard
//!
//! One daemon per PID file. Claiming the file fails while the recorded
//! process is still alive; a file left behind by a dead process is taken
//! over. The file is removed when the guard drops.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

/// Where the PID file lives when `--pid-file` is not given
///
/// `$XDG_RUNTIME_DIR/switchboard/switchboard.pid`, or
/// `/tmp/switchboard-$UID/switchboard.pid` without a runtime directory.
pub fn default_path() -> PathBuf {
    let base = dirs::runtime_dir().map_or_else(
        || {
            // SAFETY: getuid has no preconditions and cannot fail
            let uid = unsafe { libc::getuid() };
            PathBuf::from(format!("/tmp/switchboard-{uid}"))
        },
        |dir| dir.join("switchboard"),
    );
    base.join("switchboard.pid")
}

/// Holds the PID file for the lifetime of the daemon
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Record this process in `path`
    pub fn claim(path: PathBuf) -> Result<Self> {
        if let Some(pid) = live_holder(&path)? {
            bail!(
                "switchboard-daemon is already running as PID {pid}; \
                 stop it or delete {} if it is stale",
                path.display()
            );
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("cannot create PID directory {}", dir.display()))?;
        }

        let pid = std::process::id();
        fs::write(&path, format!("{pid}\n"))
            .with_context(|| format!("cannot write PID file {}", path.display()))?;
        info!(pid, path = %path.display(), "PID file claimed");
        Ok(Self { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "PID file removed"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Could not remove PID file"),
        }
    }
}

/// PID recorded in `path` if that process is still running
///
/// A stale file is deleted on the way.
fn live_holder(path: &Path) -> Result<Option<i32>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("cannot read PID file {}", path.display())),
    };
    let pid: i32 = contents
        .trim()
        .parse()
        .with_context(|| format!("PID file {} does not hold a PID", path.display()))?;

    // SAFETY: signal 0 performs the permission and existence checks only
    if unsafe { libc::kill(pid, 0) } == 0 {
        return Ok(Some(pid));
    }
    warn!(pid, path = %path.display(), "Taking over stale PID file");
    fs::remove_file(path).with_context(|| format!("cannot remove stale PID file {}", path.display()))?;
    Ok(None)
}
