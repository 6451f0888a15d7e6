use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDateTime;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use crate::clock::LOCK_TIME_FORMAT;

/// Errors acquiring the single-instance lock.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("another instance holds {path} (locked {age_secs}s ago)")]
    Held { path: PathBuf, age_secs: i64 },

    #[error("{path} was taken over by another instance")]
    Lost { path: PathBuf },

    #[error("lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Advisory single-instance lock holding the time it was last refreshed.
///
/// A lock younger than `stale_after` blocks start-up; an older or
/// unreadable one is treated as abandoned and overwritten. On drop the file
/// is removed only if it still holds the timestamp this instance wrote.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    stamp: Mutex<String>,
}

impl InstanceLock {
    pub fn acquire(
        path: impl Into<PathBuf>,
        stale_after: Duration,
        now: NaiveDateTime,
    ) -> Result<Self, LockError> {
        let path = path.into();

        match fs::read_to_string(&path) {
            Ok(text) => match parse_lock_time(&text) {
                Some(locked_at) => {
                    let age = now.signed_duration_since(locked_at);
                    let fresh = age
                        .to_std()
                        .map(|age| age < stale_after)
                        // A lock from the future (clock step) still counts as held.
                        .unwrap_or(true);
                    if fresh {
                        return Err(LockError::Held {
                            path,
                            age_secs: age.num_seconds(),
                        });
                    }
                    info!(path = %path.display(), age_secs = age.num_seconds(), "replacing stale lock");
                }
                None => {
                    warn!(path = %path.display(), "replacing unreadable lock");
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(LockError::Io { path, source }),
        }

        let stamp = now.format(LOCK_TIME_FORMAT).to_string();
        write_stamp(&path, &stamp)?;

        Ok(Self {
            path,
            stamp: Mutex::new(stamp),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the lock timestamp so a live instance never looks stale.
    ///
    /// Fails with [`LockError::Lost`] if the file no longer holds the last
    /// timestamp written here; the new owner's lock is left alone.
    pub fn refresh(&self, now: NaiveDateTime) -> Result<(), LockError> {
        let mut stamp = self.stamp.lock();
        if !self.still_owned(&stamp)? {
            return Err(LockError::Lost {
                path: self.path.clone(),
            });
        }

        let next = now.format(LOCK_TIME_FORMAT).to_string();
        write_stamp(&self.path, &next)?;
        *stamp = next;

        Ok(())
    }

    fn still_owned(&self, stamp: &str) -> Result<bool, LockError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(text.trim() == stamp),
            // Removed from under us; nobody else claims it.
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
            Err(source) => Err(LockError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let stamp = self.stamp.lock().clone();
        match self.still_owned(&stamp) {
            Ok(true) => {}
            Ok(false) => {
                warn!(path = %self.path.display(), "lock now belongs to another instance, leaving it");
                return;
            }
            Err(e) => {
                warn!(error = %e, "failed to check lock before release");
                return;
            }
        }

        match fs::remove_file(&self.path) {
            Ok(()) => info!(path = %self.path.display(), "released instance lock"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to release lock"),
        }
    }
}

fn write_stamp(path: &Path, stamp: &str) -> Result<(), LockError> {
    fs::write(path, stamp).map_err(|source| LockError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_lock_time(text: &str) -> Option<NaiveDateTime> {
    let line = text.lines().next()?.trim();
    NaiveDateTime::parse_from_str(line, LOCK_TIME_FORMAT).ok()
}
