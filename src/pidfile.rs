//! Single-instance guard
//!
//! `/tmp/<binary>.pid` holds the owning pid. A newcomer SIGTERMs a
//! stale owner and waits up to five seconds for it to release the file;
//! failing that, startup aborts. The file disappears on drop, which the
//! signal handler also triggers on SIGTERM/SIGINT.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

const EVICTION_TIMEOUT: Duration = Duration::from_secs(5);
const EVICTION_POLL: Duration = Duration::from_millis(1);

pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Claim `/tmp/<binary-name>.pid`, evicting a live predecessor.
    pub fn acquire(binary_path: &str) -> Result<Self> {
        let name = Path::new(binary_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "drive_fleet".into());
        Self::acquire_at(PathBuf::from(format!("/tmp/{name}.pid")))
    }

    /// Claim a specific path; split out for tests.
    pub fn acquire_at(path: PathBuf) -> Result<Self> {
        evict_running_process(&path)?;

        fs::write(&path, format!("{}\n", std::process::id()))
            .with_context(|| format!("couldn't create pidfile {}", path.display()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn evict_running_process(path: &Path) -> Result<()> {
    let Ok(contents) = fs::read_to_string(path) else {
        return Ok(());
    };
    eprintln!("drive_fleet is already running, killing it...");

    let pid: libc::pid_t = contents.trim().parse().unwrap_or(0);
    let killed = pid > 0 && unsafe { libc::kill(pid, libc::SIGTERM) } == 0;

    if killed {
        let deadline = Instant::now() + EVICTION_TIMEOUT;
        while path.exists() {
            if Instant::now() > deadline {
                bail!(
                    "pidfile {} still existing after 5s despite kill. is the process a zombie?",
                    path.display()
                );
            }
            std::thread::sleep(EVICTION_POLL);
        }
        Ok(())
    } else {
        let errno = std::io::Error::last_os_error().raw_os_error();
        if pid == 0 || errno == Some(libc::ESRCH) {
            // Stale file; the previous owner is gone.
            let _ = fs::remove_file(path);
            Ok(())
        } else {
            bail!("killing {pid} failed with error {errno:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_pid_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("drive_fleet_pidtest_{}_{tag}.pid", std::process::id()))
    }

    #[test]
    fn test_acquire_writes_own_pid_and_cleans_up() {
        let path = temp_pid_path("own");
        {
            let pidfile = PidFile::acquire_at(path.clone()).unwrap();
            let contents = fs::read_to_string(pidfile.path()).unwrap();
            assert_eq!(
                contents.trim().parse::<u32>().unwrap(),
                std::process::id()
            );
        }
        assert!(!path.exists(), "pidfile must vanish on drop");
    }

    #[test]
    fn test_stale_pidfile_is_replaced() {
        let path = temp_pid_path("stale");
        // An unparseable pid reads as 0, i.e. a dead owner.
        fs::write(&path, "garbage").unwrap();
        let pidfile = PidFile::acquire_at(path.clone()).unwrap();
        let contents = fs::read_to_string(pidfile.path()).unwrap();
        assert_eq!(contents.trim().parse::<u32>().unwrap(), std::process::id());
    }
}
