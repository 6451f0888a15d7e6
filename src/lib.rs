//! Host health logger for unattended machines.
//!
//! Each cycle evicts scratch data when the disk runs low, times a large
//! and many small writes into a metrics CSV, records novel lines of
//! diagnostic command output into rotating event logs, and finally
//! writes random payloads and reads them back to catch silent storage
//! corruption.

pub mod agent;
pub mod clock;
pub mod collect;
pub mod config;
pub mod events;
pub mod export;
pub mod guard;
pub mod lock;
pub mod metrics;
pub mod probe;
pub mod rotation;
pub mod scratch;
pub mod sink;
