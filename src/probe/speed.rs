use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info};

use super::random_payload;
use crate::scratch::{ScratchArena, ScratchTier};

/// Durations of one speed measurement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpeedSample {
    /// Time to write the single large file.
    pub big: Duration,
    /// Time to write all small files, sequentially.
    pub small: Duration,
}

/// Times one large write and many small writes into the normal tier.
#[derive(Debug, Clone)]
pub struct WriteSpeedProbe {
    arena: ScratchArena,
    big_file_bytes: usize,
    small_file_count: usize,
    small_file_bytes: usize,
}

impl WriteSpeedProbe {
    pub fn new(
        arena: ScratchArena,
        big_file_bytes: usize,
        small_file_count: usize,
        small_file_bytes: usize,
    ) -> Self {
        Self {
            arena,
            big_file_bytes,
            small_file_count,
            small_file_bytes,
        }
    }

    /// Measure write times. Payloads are generated before the clock starts
    /// so only the writes themselves are timed.
    pub fn measure(&self) -> Result<SpeedSample> {
        let dir = self.arena.ensure(ScratchTier::Normal)?;

        let big_payload = random_payload(self.big_file_bytes);
        let start = Instant::now();
        write_file(&dir.join("speedtest_big.test"), &big_payload)?;
        let big = start.elapsed();
        drop(big_payload);

        debug!(bytes = self.big_file_bytes, secs = big.as_secs_f64(), "big file written");

        let small_payload = random_payload(self.small_file_bytes);
        let start = Instant::now();
        for i in 0..self.small_file_count {
            write_file(&dir.join(format!("speedtest_small_{i}.test")), &small_payload)?;
        }
        let small = start.elapsed();

        info!(
            big_secs = big.as_secs_f64(),
            small_secs = small.as_secs_f64(),
            small_files = self.small_file_count,
            "write speed measured"
        );

        Ok(SpeedSample { big, small })
    }
}

fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data).with_context(|| format!("writing {}", path.display()))
}
