//! Self-observability of the logger.

pub mod health;

pub use health::HealthMetrics;
