use crate::ledger::Ledger;
use std::{
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    process,
};
use tracing::{debug, warn};

/// write_pidfile records this process's PID at `path` and registers its
/// removal in `ledger`. An existing file is left alone. Failures are logged
/// and never fatal. Returns whether the file was written
pub fn write_pidfile(path: &Path, ledger: &Ledger) -> bool {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            warn!("PID file {} already exists, not writing", path.display());
            return false;
        }
        Err(e) => {
            warn!("failed to create PID file {}: {e}", path.display());
            return false;
        }
    };

    if let Err(e) = writeln!(file, "{}", process::id()) {
        warn!("failed to write PID file {}: {e}", path.display());
        let _ = fs::remove_file(path);
        return false;
    }

    let owned: PathBuf = path.to_path_buf();
    ledger.push(format!("pidfile {}", path.display()), move || {
        match fs::remove_file(&owned) {
            Ok(()) => debug!("removed PID file {}", owned.display()),
            Err(e) => warn!("failed to remove PID file {}: {e}", owned.display()),
        }
    });

    true
}
