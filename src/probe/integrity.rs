use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use rand::Rng;
use tracing::{debug, error, info};

use super::random_payload;
use crate::clock;
use crate::scratch::{ScratchArena, ScratchTier};
use crate::sink::ByteSink;

/// Default payload size per file.
pub const DEFAULT_PAYLOAD_BYTES: usize = 10_000_000;

const READ_CHUNK: usize = 64 * 1024;

/// First point where a file on disk departs from its reference bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Divergence {
    /// Bytes differ at this offset.
    Byte { offset: u64 },
    /// Content matches up to the shorter length but sizes differ.
    Length { expected: u64, actual: u64 },
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Byte { offset } => write!(f, "byte mismatch at offset {offset}"),
            Self::Length { expected, actual } => {
                write!(f, "length mismatch expected {expected} got {actual}")
            }
        }
    }
}

/// A file written by the probe together with the bytes meant for it.
#[derive(Debug, Clone)]
pub struct WrittenFile {
    pub path: PathBuf,
    pub expected: Vec<u8>,
}

impl WrittenFile {
    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Summary of one probe run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    pub iterations: u64,
    pub mismatches: u64,
    pub bytes_written: u64,
    pub elapsed: Duration,
}

/// Writes pairs of random payloads and verifies each against its own
/// in-memory reference after reading it back from disk.
#[derive(Debug, Clone)]
pub struct WriteIntegrityProbe {
    arena: ScratchArena,
    payload_bytes: usize,
}

impl WriteIntegrityProbe {
    pub fn new(arena: ScratchArena, payload_bytes: usize) -> Self {
        Self {
            arena,
            payload_bytes,
        }
    }

    /// Keep writing and verifying pairs until `duration` has elapsed.
    ///
    /// The number of iterations depends on storage throughput. Mismatches
    /// are recorded and the run continues.
    pub fn run(&self, duration: Duration) -> Result<IntegrityReport> {
        info!(seconds = duration.as_secs_f64(), "starting write integrity probe");

        let start = Instant::now();
        let mut report = IntegrityReport::default();

        while start.elapsed() < duration {
            let pair = self.write_pair()?;
            report.iterations += 1;
            report.bytes_written += pair.iter().map(|f| f.expected.len() as u64).sum::<u64>();

            if self.verify_pair(&pair[0], &pair[1], clock::now())? {
                report.mismatches += 1;
            }
        }

        report.elapsed = start.elapsed();
        info!(
            iterations = report.iterations,
            mismatches = report.mismatches,
            elapsed_secs = report.elapsed.as_secs_f64(),
            "write integrity probe finished"
        );

        Ok(report)
    }

    /// Generate two independent payloads and write each to its own file
    /// under the normal tier.
    pub fn write_pair(&self) -> Result<[WrittenFile; 2]> {
        let dir = self.arena.ensure(ScratchTier::Normal)?;
        let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);

        let first = self.write_one(&dir, suffix, 1)?;
        let second = self.write_one(&dir, suffix, 2)?;

        Ok([first, second])
    }

    fn write_one(&self, dir: &Path, suffix: u32, ordinal: u8) -> Result<WrittenFile> {
        let path = dir.join(format!(
            "permawrite_{}_{suffix}_{ordinal}.test",
            self.payload_bytes
        ));
        let expected = random_payload(self.payload_bytes);

        fs::write(&path, &expected).with_context(|| format!("writing {}", path.display()))?;

        Ok(WrittenFile { path, expected })
    }

    /// Read both files back and compare each to its own reference. On any
    /// divergence both files are copied to quarantine and exactly one error
    /// record is appended. Returns whether the pair was quarantined.
    pub fn verify_pair(
        &self,
        first: &WrittenFile,
        second: &WrittenFile,
        now: NaiveDateTime,
    ) -> Result<bool> {
        let first_divergence = compare_with_reference(&first.path, &first.expected)?;
        let second_divergence = compare_with_reference(&second.path, &second.expected)?;

        let reason = match (first_divergence, second_divergence) {
            (None, None) => {
                debug!(file = %first.path.display(), "pair verified");
                return Ok(false);
            }
            (Some(d), None) => format!("{} {d}", first.file_name()),
            (None, Some(d)) => format!("{} {d}", second.file_name()),
            (Some(a), Some(b)) => {
                format!("{} {a}; {} {b}", first.file_name(), second.file_name())
            }
        };

        error!(
            first = %first.path.display(),
            second = %second.path.display(),
            reason = %reason,
            "write integrity mismatch, quarantining files"
        );

        self.quarantine(first, second, &reason, now)?;

        Ok(true)
    }

    fn quarantine(
        &self,
        first: &WrittenFile,
        second: &WrittenFile,
        reason: &str,
        now: NaiveDateTime,
    ) -> Result<()> {
        let dir = self.arena.ensure(ScratchTier::Quarantine)?;

        for file in [first, second] {
            let target = dir.join(file.file_name());
            fs::copy(&file.path, &target).with_context(|| {
                format!("copying {} to {}", file.path.display(), target.display())
            })?;
        }

        let record = format!(
            "{},{},{},{}\n",
            clock::record_time(now),
            first.file_name(),
            second.file_name(),
            reason.replace(',', ";")
        );
        ByteSink::new(self.arena.error_log_path()).append(record.as_bytes())
    }
}

/// Stream `path` from disk and find where it departs from `expected`.
pub fn compare_with_reference(path: &Path, expected: &[u8]) -> Result<Option<Divergence>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut reader = BufReader::with_capacity(READ_CHUNK, file);
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut offset: usize = 0;

    loop {
        let n = reader
            .read(&mut chunk)
            .with_context(|| format!("reading {}", path.display()))?;
        if n == 0 {
            break;
        }

        let read = &chunk[..n];
        let reference = expected.get(offset..).unwrap_or_default();
        let common = read.len().min(reference.len());

        if let Some(pos) = read[..common]
            .iter()
            .zip(&reference[..common])
            .position(|(a, b)| a != b)
        {
            return Ok(Some(Divergence::Byte {
                offset: (offset + pos) as u64,
            }));
        }

        offset += n;
    }

    if offset != expected.len() {
        return Ok(Some(Divergence::Length {
            expected: expected.len() as u64,
            actual: offset as u64,
        }));
    }

    Ok(None)
}
