//! Storage probes that generate the scratch artifacts.
//!
//! - **integrity**: write random payloads, read them back and quarantine
//!   anything that does not match what was written.
//! - **speed**: time one large write and many small writes.

pub mod integrity;
pub mod speed;

pub use integrity::{Divergence, IntegrityReport, WriteIntegrityProbe, WrittenFile};
pub use speed::{SpeedSample, WriteSpeedProbe};

use rand::RngCore;

/// Random payload of `len` bytes.
pub(crate) fn random_payload(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}
