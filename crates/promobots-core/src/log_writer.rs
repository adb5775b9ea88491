//! Size-rotating log file writer.
//!
//! When the active file would grow past `max_size` bytes it is renamed to
//! `<name>.1`, older backups shift up by one, and anything beyond
//! `max_backups` or older than `max_age` is removed.
//!
//! The writer sits underneath the tracing subscriber, so it cannot emit
//! tracing events itself. Backups it fails to remove are noted at the top of
//! the fresh file instead.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

const MIB: u64 = 1024 * 1024;
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy)]
pub struct RotationPolicy {
    /// Rotate once the active file would exceed this many bytes. `0` disables rotation.
    pub max_size: u64,
    /// Number of rotated files to keep. `0` keeps none.
    pub max_backups: u32,
    /// Remove rotated files older than this. `None` keeps them regardless of age.
    pub max_age: Option<Duration>,
}

impl RotationPolicy {
    /// Build from logger settings expressed in MiB and days.
    pub fn from_settings(max_size_mib: u64, max_backups: u32, max_age_days: u32) -> Self {
        Self {
            max_size: max_size_mib.saturating_mul(MIB),
            max_backups,
            max_age: (max_age_days > 0).then(|| DAY * max_age_days),
        }
    }
}

pub struct RotatingFile {
    path: PathBuf,
    policy: RotationPolicy,
    file: File,
    written: u64,
}

impl RotatingFile {
    /// Open `path` for appending, creating parent directories as needed.
    pub fn open(path: impl Into<PathBuf>, policy: RotationPolicy) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = open_append(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            policy,
            file,
            written,
        })
    }

    fn backup_path(&self, index: u32) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        if self.policy.max_backups == 0 {
            fs::remove_file(&self.path)?;
        } else {
            let oldest = self.backup_path(self.policy.max_backups);
            if oldest.exists() {
                fs::remove_file(&oldest)?;
            }
            for index in (1..self.policy.max_backups).rev() {
                let from = self.backup_path(index);
                if from.exists() {
                    fs::rename(&from, self.backup_path(index + 1))?;
                }
            }
            fs::rename(&self.path, self.backup_path(1))?;
        }

        let failures = self.prune_expired();
        self.file = open_append(&self.path)?;
        self.written = 0;
        for (backup, err) in failures {
            let note = format!(
                "log rotation: failed to remove expired {}: {err}\n",
                backup.display()
            );
            self.file.write_all(note.as_bytes())?;
            self.written += note.len() as u64;
        }
        Ok(())
    }

    /// Remove backups older than `max_age`, returning the ones that could not be removed.
    fn prune_expired(&self) -> Vec<(PathBuf, io::Error)> {
        let mut failures = Vec::new();
        let Some(max_age) = self.policy.max_age else {
            return failures;
        };
        let now = SystemTime::now();
        for index in 1..=self.policy.max_backups {
            let backup = self.backup_path(index);
            let expired = fs::metadata(&backup)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age > max_age);
            if !expired {
                continue;
            }
            match fs::remove_file(&backup) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => failures.push((backup, e)),
            }
        }
        failures
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let incoming = buf.len() as u64;
        if self.policy.max_size > 0
            && self.written > 0
            && self.written + incoming > self.policy.max_size
        {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn policy(max_size: u64, max_backups: u32) -> RotationPolicy {
        RotationPolicy {
            max_size,
            max_backups,
            max_age: None,
        }
    }

    #[test]
    fn writes_below_limit_stay_in_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let mut w = RotatingFile::open(&path, policy(1024, 2)).unwrap();
        w.write_all(b"hello\n").unwrap();
        w.write_all(b"world\n").unwrap();
        w.flush().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "hello\nworld\n");
        assert!(!dir.path().join("app.log.1").exists());
    }

    #[test]
    fn rotation_shifts_backups_and_caps_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let mut w = RotatingFile::open(&path, policy(10, 2)).unwrap();

        for line in ["first-1234\n", "second-123\n", "third-1234\n", "fourth-123\n"] {
            w.write_all(line.as_bytes()).unwrap();
        }
        w.flush().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "fourth-123\n");
        assert_eq!(
            fs::read_to_string(dir.path().join("app.log.1")).unwrap(),
            "third-1234\n"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("app.log.2")).unwrap(),
            "second-123\n"
        );
        assert!(!dir.path().join("app.log.3").exists());
    }

    #[test]
    fn zero_backups_truncates_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let mut w = RotatingFile::open(&path, policy(8, 0)).unwrap();
        w.write_all(b"aaaaaaa\n").unwrap();
        w.write_all(b"bbbbbbb\n").unwrap();
        w.flush().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "bbbbbbb\n");
        assert!(!dir.path().join("app.log.1").exists());
    }

    #[test]
    fn reopening_counts_existing_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, b"0123456789").unwrap();

        let mut w = RotatingFile::open(&path, policy(12, 1)).unwrap();
        w.write_all(b"abc").unwrap();
        w.flush().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "abc");
        assert_eq!(
            fs::read_to_string(dir.path().join("app.log.1")).unwrap(),
            "0123456789"
        );
    }

    #[test]
    fn expired_backups_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let old = dir.path().join("app.log.2");
        fs::write(&old, b"ancient\n").unwrap();
        File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(SystemTime::now() - DAY * 3)
            .unwrap();

        let policy = RotationPolicy {
            max_age: Some(DAY),
            ..policy(8, 3)
        };
        let mut w = RotatingFile::open(&path, policy).unwrap();
        w.write_all(b"aaaaaaa\n").unwrap();
        w.write_all(b"bbbbbbb\n").unwrap();
        w.flush().unwrap();

        // The stale backup was shifted to .3 and then removed for its age.
        assert!(!dir.path().join("app.log.3").exists());
        assert_eq!(
            fs::read_to_string(dir.path().join("app.log.1")).unwrap(),
            "aaaaaaa\n"
        );
        assert_eq!(fs::read_to_string(&path).unwrap(), "bbbbbbb\n");
    }

    #[cfg(unix)]
    #[test]
    fn failed_prune_is_noted_in_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        // A directory cannot be removed with remove_file.
        let stuck = dir.path().join("app.log.2");
        fs::create_dir(&stuck).unwrap();
        File::open(&stuck)
            .unwrap()
            .set_modified(SystemTime::now() - DAY * 3)
            .unwrap();

        let policy = RotationPolicy {
            max_age: Some(DAY),
            ..policy(8, 3)
        };
        let mut w = RotatingFile::open(&path, policy).unwrap();
        w.write_all(b"aaaaaaa\n").unwrap();
        w.write_all(b"bbbbbbb\n").unwrap();
        w.flush().unwrap();

        let current = fs::read_to_string(&path).unwrap();
        assert!(
            current.starts_with("log rotation: failed to remove expired"),
            "{current}"
        );
        assert!(current.contains("app.log.3"));
        assert!(current.ends_with("bbbbbbb\n"));
        assert!(dir.path().join("app.log.3").is_dir());
    }

    #[test]
    fn settings_convert_units() {
        let p = RotationPolicy::from_settings(2, 5, 0);
        assert_eq!(p.max_size, 2 * MIB);
        assert_eq!(p.max_backups, 5);
        assert!(p.max_age.is_none());
        assert_eq!(
            RotationPolicy::from_settings(1, 1, 2).max_age,
            Some(Duration::from_secs(2 * 86_400))
        );
    }
}
