use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use sysinfo::{Pid, System};
use tracing::{debug, error, info, warn};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// One raw memory reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryReading {
    /// Resident memory of this process in MB
    pub process_mb: f64,
    /// System-wide memory in use, percent
    pub system_percent: f64,
    /// System memory still available in MB
    pub available_mb: f64,
}

/// Source of memory readings
pub trait MemoryProbe: Send {
    /// `None` when memory cannot be measured on this host
    fn read(&self) -> Option<MemoryReading>;
}

/// Probe backed by `sysinfo`
pub struct SysinfoProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("Cannot determine own pid, process memory unavailable: {}", e);
                None
            }
        };
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn read(&self) -> Option<MemoryReading> {
        let pid = self.pid?;
        let mut system = self.system.lock().ok()?;

        system.refresh_memory();
        if !system.refresh_process(pid) {
            return None;
        }

        let total = system.total_memory();
        if total == 0 {
            return None;
        }
        let available = system.available_memory();
        let process = system.process(pid)?.memory();

        Some(MemoryReading {
            process_mb: process as f64 / BYTES_PER_MB,
            system_percent: total.saturating_sub(available) as f64 / total as f64 * 100.0,
            available_mb: available as f64 / BYTES_PER_MB,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// System usage above this percent raises a warning
    pub warning_percent: f64,
    /// Process growth above baseline, in MB, that raises a warning
    pub growth_cap_mb: f64,
    /// System usage above this percent stops admission
    pub hard_stop_percent: f64,
    /// Available memory below this, in MB, stops admission
    pub min_available_mb: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            warning_percent: 80.0,
            growth_cap_mb: 2000.0,
            hard_stop_percent: 95.0,
            min_available_mb: 500.0,
        }
    }
}

/// Memory statistics snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub process_mb: f64,
    /// Process growth since the monitor was created
    pub growth_mb: f64,
    pub system_percent: f64,
    pub available_mb: f64,
    pub timestamp: DateTime<Utc>,
    /// False when the probe could not measure anything
    pub monitoring_available: bool,
}

impl MemoryStats {
    fn unavailable() -> Self {
        Self {
            process_mb: 0.0,
            growth_mb: 0.0,
            system_percent: 0.0,
            available_mb: 0.0,
            timestamp: Utc::now(),
            monitoring_available: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryHealth {
    pub status: HealthStatus,
    pub warnings: Vec<String>,
    pub stats: MemoryStats,
}

impl MemoryHealth {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Watches memory and decides whether new work may start
pub struct MemoryMonitor {
    probe: Box<dyn MemoryProbe>,
    config: MemoryConfig,
    baseline_mb: f64,
}

impl MemoryMonitor {
    /// Monitor this process with `sysinfo` and default thresholds
    pub fn new() -> Self {
        Self::with_probe(MemoryConfig::default(), SysinfoProbe::new())
    }

    pub fn with_config(config: MemoryConfig) -> Self {
        Self::with_probe(config, SysinfoProbe::new())
    }

    pub fn with_probe(config: MemoryConfig, probe: impl MemoryProbe + 'static) -> Self {
        let baseline_mb = probe.read().map(|r| r.process_mb).unwrap_or(0.0);
        info!("Memory monitor initialized. Initial: {:.1}MB", baseline_mb);

        Self {
            probe: Box::new(probe),
            config,
            baseline_mb,
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Current memory statistics
    pub fn stats(&self) -> MemoryStats {
        match self.probe.read() {
            Some(reading) => MemoryStats {
                process_mb: reading.process_mb,
                growth_mb: reading.process_mb - self.baseline_mb,
                system_percent: reading.system_percent,
                available_mb: reading.available_mb,
                timestamp: Utc::now(),
                monitoring_available: true,
            },
            None => MemoryStats::unavailable(),
        }
    }

    /// Classify current memory usage
    pub fn check_health(&self) -> MemoryHealth {
        let stats = self.stats();
        if !stats.monitoring_available {
            return MemoryHealth {
                status: HealthStatus::Unavailable,
                warnings: Vec::new(),
                stats,
            };
        }

        let mut warnings = Vec::new();
        if stats.system_percent > self.config.warning_percent {
            warnings.push(format!(
                "System memory usage at {:.1}% (available: {:.1}MB)",
                stats.system_percent, stats.available_mb
            ));
        }
        if stats.growth_mb > self.config.growth_cap_mb {
            warnings.push(format!(
                "Process memory growth: {:.1}MB. Consider fewer workers.",
                stats.growth_mb
            ));
        }

        let status = if warnings.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Warning
        };

        MemoryHealth {
            status,
            warnings,
            stats,
        }
    }

    /// Whether it is safe to admit more work
    pub fn should_continue(&self) -> bool {
        let health = self.check_health();
        if health.status == HealthStatus::Unavailable {
            debug!("Memory monitoring unavailable, continuing");
            return true;
        }

        for warning in &health.warnings {
            warn!("Memory: {}", warning);
        }

        let stats = &health.stats;
        if stats.system_percent > self.config.hard_stop_percent
            || stats.available_mb < self.config.min_available_mb
        {
            error!(
                system_percent = stats.system_percent,
                available_mb = stats.available_mb,
                "Memory threshold exceeded, holding new work"
            );
            return false;
        }

        true
    }
}

impl Default for MemoryMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// Replays readings, repeating the last one
    #[derive(Clone)]
    struct ScriptedProbe(Arc<Mutex<VecDeque<Option<MemoryReading>>>>);

    impl ScriptedProbe {
        fn new(readings: Vec<Option<MemoryReading>>) -> Self {
            Self(Arc::new(Mutex::new(readings.into())))
        }
    }

    impl MemoryProbe for ScriptedProbe {
        fn read(&self) -> Option<MemoryReading> {
            let mut readings = self.0.lock().unwrap();
            if readings.len() > 1 {
                readings.pop_front().flatten()
            } else {
                readings.front().copied().flatten()
            }
        }
    }

    fn reading(process_mb: f64, system_percent: f64, available_mb: f64) -> Option<MemoryReading> {
        Some(MemoryReading {
            process_mb,
            system_percent,
            available_mb,
        })
    }

    #[test]
    fn test_healthy_system() {
        let monitor = MemoryMonitor::with_probe(
            MemoryConfig::default(),
            ScriptedProbe::new(vec![reading(100.0, 40.0, 8000.0)]),
        );

        let health = monitor.check_health();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.warnings.is_empty());
        assert_eq!(health.stats.growth_mb, 0.0);
        assert!(monitor.should_continue());
    }

    #[test]
    fn test_warnings_for_usage_and_growth() {
        let monitor = MemoryMonitor::with_probe(
            MemoryConfig::default(),
            ScriptedProbe::new(vec![reading(100.0, 40.0, 8000.0), reading(2200.0, 85.0, 3000.0)]),
        );

        let health = monitor.check_health();

        assert_eq!(health.status, HealthStatus::Warning);
        assert_eq!(health.warnings.len(), 2);
        assert!((health.stats.growth_mb - 2100.0).abs() < 1e-9);
        // warnings alone do not stop admission
        assert!(monitor.should_continue());
    }

    #[test]
    fn test_low_available_memory_stops_admission() {
        let monitor = MemoryMonitor::with_probe(
            MemoryConfig::default(),
            ScriptedProbe::new(vec![
                reading(100.0, 50.0, 8000.0),
                reading(100.0, 50.0, 400.0),
                reading(100.0, 50.0, 6000.0),
            ]),
        );

        assert!(!monitor.should_continue());
        assert!(monitor.should_continue());
    }

    #[test]
    fn test_hard_stop_percent() {
        let monitor = MemoryMonitor::with_probe(
            MemoryConfig::default(),
            ScriptedProbe::new(vec![reading(100.0, 96.0, 4000.0)]),
        );
        assert!(!monitor.should_continue());
    }

    #[test]
    fn test_unavailable_probe_never_blocks() {
        let monitor = MemoryMonitor::with_probe(MemoryConfig::default(), ScriptedProbe::new(vec![None]));

        let health = monitor.check_health();
        assert_eq!(health.status, HealthStatus::Unavailable);
        assert!(!health.stats.monitoring_available);
        assert!(monitor.should_continue());
    }

    #[test]
    fn test_sysinfo_probe_reads_this_process() {
        let monitor = MemoryMonitor::new();
        let stats = monitor.stats();

        if stats.monitoring_available {
            assert!(stats.process_mb > 0.0);
            assert!((0.0..=100.0).contains(&stats.system_percent));
        }
    }
}
