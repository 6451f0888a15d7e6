use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock;
use crate::collect::{
    self, mount, CommandOutputSource, MetricsSource, NoMetrics, ScriptMetricsSource,
    ShellOutputSource, WithErrorLog,
};
use crate::config::{Config, EventCommand};
use crate::events::{EventCycleSummary, EventLogger};
use crate::export::health::HealthMetrics;
use crate::guard::{DiskCapacityGuard, Eviction, FreeSpace, GuardReport, StatvfsFreeSpace};
use crate::lock::{InstanceLock, LockError};
use crate::metrics::{MetricsLogger, MetricsRow};
use crate::probe::{IntegrityReport, SpeedSample, WriteIntegrityProbe, WriteSpeedProbe};
use crate::scratch::{ScratchArena, ScratchTier};

/// Directory under the base path holding event segments.
pub const EVENTS_DIR: &str = "events";

/// Directory under the base path holding metrics segments.
pub const METRICS_DIR: &str = "metrics";

type TimeSource = Box<dyn Fn() -> NaiveDateTime + Send + Sync>;

/// Outcome of one full cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub guard: GuardReport,
    pub speed: SpeedSample,
    /// Segment that received this cycle's row; `None` when sampling failed.
    pub metrics_segment: Option<PathBuf>,
    pub events: EventCycleSummary,
    pub integrity: IntegrityReport,
    pub elapsed: Duration,
}

/// Pick the directory that `events/` and `metrics/` live under.
///
/// An explicit path wins, then the first removable mount, then the
/// working directory. Called every cycle so storage plugged in later is
/// picked up.
pub fn resolve_base(configured: Option<&Path>) -> PathBuf {
    if let Some(base) = configured {
        return base.to_path_buf();
    }

    mount::find_removable_mount().unwrap_or_else(|| PathBuf::from("."))
}

/// One pass over every core component, in a fixed order.
pub struct Cycle {
    arena: ScratchArena,
    threshold_mb: u64,
    ceiling: u64,
    guard: DiskCapacityGuard,
    speed: WriteSpeedProbe,
    integrity: WriteIntegrityProbe,
    integrity_duration: Duration,
    commands: Vec<EventCommand>,
    command_source: Box<dyn CommandOutputSource>,
    metrics_source: Box<dyn MetricsSource>,
    health: Option<Arc<HealthMetrics>>,
    now: TimeSource,
}

impl Cycle {
    pub fn from_config(cfg: &Config) -> Self {
        let arena = ScratchArena::new(&cfg.scratch_root);

        let metrics_source: Box<dyn MetricsSource> = match &cfg.metrics.command {
            Some(command) => Box::new(ScriptMetricsSource::new(command.clone())),
            None => Box::new(NoMetrics),
        };

        let mut commands = cfg.events.commands.clone();
        commands.push(collect::error_log_command(&arena.error_log_path()));

        Self {
            guard: DiskCapacityGuard::new(
                arena.clone(),
                cfg.guard.threshold_mb,
                Box::new(StatvfsFreeSpace::new(cfg.free_space_path())),
            ),
            threshold_mb: cfg.guard.threshold_mb,
            ceiling: cfg.rotation.segment_ceiling_bytes,
            speed: WriteSpeedProbe::new(
                arena.clone(),
                cfg.speed.big_file_bytes,
                cfg.speed.small_file_count,
                cfg.speed.small_file_bytes,
            ),
            integrity: WriteIntegrityProbe::new(arena.clone(), cfg.integrity.payload_bytes),
            integrity_duration: cfg.integrity.duration,
            commands,
            command_source: Box::new(ShellOutputSource),
            metrics_source,
            health: None,
            now: Box::new(clock::now),
            arena,
        }
    }

    pub fn with_command_source(mut self, source: Box<dyn CommandOutputSource>) -> Self {
        self.command_source = source;
        self
    }

    pub fn with_metrics_source(mut self, source: Box<dyn MetricsSource>) -> Self {
        self.metrics_source = source;
        self
    }

    pub fn with_free_space(mut self, free_space: Box<dyn FreeSpace>) -> Self {
        self.guard = DiskCapacityGuard::new(self.arena.clone(), self.threshold_mb, free_space);
        self
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Replace the wall clock; read when the metrics row is built and again
    /// right before event capture.
    pub fn with_clock(
        mut self,
        now: impl Fn() -> NaiveDateTime + Send + Sync + 'static,
    ) -> Self {
        self.now = Box::new(now);
        self
    }

    /// Streams recorded each cycle, the built-in error log stream last.
    pub fn commands(&self) -> &[EventCommand] {
        &self.commands
    }

    pub fn event_logger(&self, base: &Path) -> EventLogger {
        EventLogger::new(base.join(EVENTS_DIR), self.ceiling)
    }

    pub fn metrics_logger(&self, base: &Path) -> MetricsLogger {
        MetricsLogger::new(base.join(METRICS_DIR), self.ceiling)
    }

    /// Run guard, speed probe and metrics, events, then the integrity probe,
    /// logging under `base`.
    ///
    /// A failed metrics sample only drops this cycle's row. Any other
    /// failing step ends the cycle and nothing after it runs.
    pub fn run_once(&self, base: &Path) -> Result<CycleReport> {
        let start = Instant::now();
        let result = self.run_steps(base, start);

        if let Some(health) = &self.health {
            health.cycle_duration.observe(start.elapsed().as_secs_f64());
            match &result {
                Ok(_) => health.cycles.inc(),
                Err(_) => health.cycle_failures.inc(),
            }
        }

        result
    }

    fn run_steps(&self, base: &Path, start: Instant) -> Result<CycleReport> {
        let guard = self.guard.enforce().context("enforcing disk capacity")?;
        self.observe_guard(&guard);

        let speed = self.speed.measure().context("measuring write speed")?;
        if let Some(health) = &self.health {
            health
                .write_speed_seconds
                .with_label_values(&["big"])
                .set(speed.big.as_secs_f64());
            health
                .write_speed_seconds
                .with_label_values(&["small"])
                .set(speed.small.as_secs_f64());
        }
        let metrics_segment = self.record_metrics(base, speed)?;

        let events_logger = self.event_logger(base);
        note_reboot(&events_logger);

        let error_log = self.arena.error_log_path();
        let source = WithErrorLog::new(self.command_source.as_ref(), &error_log);
        let events = events_logger
            .record_cycle(&self.commands, &source, (self.now)())
            .context("recording events")?;
        if let Some(health) = &self.health {
            health.event_lines_appended.inc_by(events.appended_lines as f64);
        }

        let integrity = self
            .integrity
            .run(self.integrity_duration)
            .context("running write integrity probe")?;
        if let Some(health) = &self.health {
            health.integrity_iterations.inc_by(integrity.iterations as f64);
            health.integrity_mismatches.inc_by(integrity.mismatches as f64);
        }

        let report = CycleReport {
            guard,
            speed,
            metrics_segment,
            events,
            integrity,
            elapsed: start.elapsed(),
        };

        info!(
            eviction = ?report.guard.eviction,
            metrics_row = report.metrics_segment.is_some(),
            event_lines = report.events.appended_lines,
            integrity_iterations = report.integrity.iterations,
            integrity_mismatches = report.integrity.mismatches,
            elapsed_secs = report.elapsed.as_secs_f64(),
            "cycle complete"
        );

        Ok(report)
    }

    fn record_metrics(&self, base: &Path, speed: SpeedSample) -> Result<Option<PathBuf>> {
        let columns = match self.metrics_source.sample() {
            Ok(columns) => columns,
            Err(e) => {
                error!(error = format!("{e:#}"), "sampling metrics failed, skipping metrics row");
                return Ok(None);
            }
        };

        let row = MetricsRow {
            time: (self.now)(),
            write_big: speed.big,
            write_small: speed.small,
            columns,
        };
        let segment = self
            .metrics_logger(base)
            .record(&row)
            .context("recording metrics")?
            .path;

        if let Some(health) = &self.health {
            health.metrics_rows.inc();
        }

        Ok(Some(segment))
    }

    fn observe_guard(&self, report: &GuardReport) {
        let Some(health) = &self.health else {
            return;
        };

        health.free_space_bytes.set(report.available_bytes as f64);
        let evicted: &[ScratchTier] = match report.eviction {
            Eviction::None => &[],
            Eviction::Normal => &[ScratchTier::Normal],
            Eviction::Both => &ScratchTier::ALL,
        };
        for tier in evicted {
            health.evictions.with_label_values(&[tier.as_str()]).inc();
        }
    }
}

fn note_reboot(events: &EventLogger) {
    let last = match events.last_capture_time() {
        Ok(last) => last,
        Err(e) => {
            warn!(error = %e, "reading last capture time");
            return;
        }
    };

    let Some(boot) = collect::boot_time_unix().and_then(local_time) else {
        debug!("host boot time unavailable");
        return;
    };

    if booted_since(boot, last) {
        info!(
            boot_time = %boot,
            last_capture = ?last,
            "host booted since the last completed event capture"
        );
    }
}

fn local_time(unix_secs: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp(unix_secs, 0).map(|t| t.with_timezone(&Local).naive_local())
}

/// Whether the host booted after the last completed capture.
///
/// The marker has minute precision, so a boot in the same minute counts.
pub fn booted_since(boot: NaiveDateTime, last_capture: Option<NaiveDateTime>) -> bool {
    match last_capture {
        Some(last) => boot >= last,
        None => false,
    }
}

/// Lock refresh period: twice per staleness window.
fn refresh_period(stale_after: Duration) -> Duration {
    (stale_after / 2).max(Duration::from_secs(1))
}

/// Rewrite the lock timestamp every `period` until `stop` fires or the
/// lock is taken over.
async fn keep_lock_fresh(lock: Arc<InstanceLock>, period: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match lock.refresh(clock::now()) {
            Ok(()) => {}
            Err(e @ LockError::Lost { .. }) => {
                error!(error = %e, "instance lock lost, no longer refreshing");
                return;
            }
            Err(e) => warn!(error = %e, "refreshing instance lock"),
        }
    }
}

/// Daemon loop around [`Cycle`].
pub struct Agent {
    cycle: Arc<Cycle>,
    lock: Arc<InstanceLock>,
    stale_after: Duration,
    base_path: Option<PathBuf>,
    interval: Duration,
    health: Option<Arc<HealthMetrics>>,
}

impl Agent {
    /// Build the agent from configuration. The caller already holds the lock.
    pub fn new(cfg: &Config, lock: InstanceLock) -> Result<Self> {
        let health = if cfg.health.enabled {
            Some(Arc::new(
                HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?,
            ))
        } else {
            None
        };

        let mut cycle = Cycle::from_config(cfg);
        if let Some(health) = &health {
            cycle = cycle.with_health(Arc::clone(health));
        }

        info!(scratch = %cfg.scratch_root.display(), "agent configured");

        Ok(Self {
            cycle: Arc::new(cycle),
            lock: Arc::new(lock),
            stale_after: cfg.lock.stale_after,
            base_path: cfg.base_path.clone(),
            interval: cfg.cycle_interval,
            health,
        })
    }

    /// Run cycles until cancelled, or a single cycle when `once` is set.
    ///
    /// The lock is refreshed on its own schedule for the whole run.
    /// Cancellation is only observed between cycles so segments are never
    /// left half-written.
    pub async fn run(&self, cancel: CancellationToken, once: bool) -> Result<()> {
        if let Some(health) = &self.health {
            health.start().await.context("starting health server")?;
        }

        let stop_refresh = CancellationToken::new();
        let refresher = tokio::spawn(keep_lock_fresh(
            Arc::clone(&self.lock),
            refresh_period(self.stale_after),
            stop_refresh.clone(),
        ));

        let result = self.cycle_loop(&cancel, once).await;

        stop_refresh.cancel();
        if let Err(e) = refresher.await {
            warn!(error = %e, "lock refresh task ended abnormally");
        }

        if let Some(health) = &self.health {
            health.stop();
        }

        result
    }

    async fn cycle_loop(&self, cancel: &CancellationToken, once: bool) -> Result<()> {
        let mut current_base: Option<PathBuf> = None;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let cycle = Arc::clone(&self.cycle);
            let configured = self.base_path.clone();
            let (base, result) = tokio::task::spawn_blocking(move || {
                let base = resolve_base(configured.as_deref());
                let result = cycle.run_once(&base);
                (base, result)
            })
            .await
            .context("cycle task panicked")?;

            if current_base.as_ref() != Some(&base) {
                info!(base = %base.display(), "logging under base path");
                current_base = Some(base);
            }

            if let Err(e) = result {
                error!(error = format!("{e:#}"), "cycle failed");
            }

            if once {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("agent stopped");

        Ok(())
    }
}
