//! Bootstrap utilities.

use std::{io, path::Path};

/// Writes the current process ID to the specified file.
///
/// Any existing file is replaced, so a stale PID file left behind by a previous run never blocks a new one.
///
/// # Errors
///
/// If the PID cannot be written to the file, an error is returned.
pub fn update_pid_file<P: AsRef<Path>>(pid_file: P) -> io::Result<()> {
    let pid_string = std::process::id().to_string();

    std::fs::write(pid_file, pid_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrites_stale_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("sandbox.pid");
        std::fs::write(&pid_file, "999999999").unwrap();

        update_pid_file(&pid_file).unwrap();

        let written = std::fs::read_to_string(&pid_file).unwrap();
        assert_eq!(written, std::process::id().to_string());
    }
}
