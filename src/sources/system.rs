//! Host metrics read from procfs (Linux).
//!
//! Emits `cpu_usage` (percent busy since the previous poll), `memory_usage`
//! (percent of MemTotal not available) and `load_1m`.

use std::path::PathBuf;

use super::poll::Poller;
use super::MetricReading;
use crate::error::SourceError;

/// Aggregate CPU jiffies from the first line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

pub struct SystemPoller {
    root: PathBuf,
    last_cpu: Option<CpuTimes>,
}

impl Default for SystemPoller {
    fn default() -> Self {
        Self::with_root("/proc")
    }
}

impl SystemPoller {
    /// Read from an alternate procfs root (used by tests).
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            last_cpu: None,
        }
    }

    async fn read(&self, name: &str) -> Result<String, SourceError> {
        let path = self.root.join(name);
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| SourceError::Io(format!("{}: {e}", path.display())))
    }
}

#[async_trait::async_trait]
impl Poller for SystemPoller {
    async fn open(&mut self) -> Result<(), SourceError> {
        let stat = self.read("stat").await?;
        self.last_cpu = Some(parse_cpu_times(&stat)?);
        Ok(())
    }

    async fn poll(&mut self) -> Result<Vec<MetricReading>, SourceError> {
        let mut readings = Vec::with_capacity(3);

        let cpu = parse_cpu_times(&self.read("stat").await?)?;
        if let Some(prev) = self.last_cpu.replace(cpu) {
            if let Some(busy) = cpu_busy_percent(prev, cpu) {
                readings.push(MetricReading::new("cpu_usage", busy));
            }
        }

        let meminfo = self.read("meminfo").await?;
        if let Some(used) = memory_used_percent(&meminfo) {
            readings.push(MetricReading::new("memory_usage", used));
        }

        let loadavg = self.read("loadavg").await?;
        if let Some(load) = parse_load_1m(&loadavg) {
            readings.push(MetricReading::new("load_1m", load));
        }

        Ok(readings)
    }
}

fn parse_cpu_times(stat: &str) -> Result<CpuTimes, SourceError> {
    let line = stat
        .lines()
        .find(|l| l.starts_with("cpu "))
        .ok_or_else(|| SourceError::Decode("no aggregate cpu line in stat".into()))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|f| f.parse::<u64>())
        .collect::<Result<_, _>>()
        .map_err(|e| SourceError::Decode(format!("bad cpu field: {e}")))?;
    if fields.len() < 4 {
        return Err(SourceError::Decode("truncated cpu line".into()));
    }
    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Ok(CpuTimes {
        idle,
        total: fields.iter().sum(),
    })
}

fn cpu_busy_percent(prev: CpuTimes, cur: CpuTimes) -> Option<f64> {
    let total = cur.total.checked_sub(prev.total)?;
    let idle = cur.idle.checked_sub(prev.idle)?;
    if total == 0 {
        return None;
    }
    Some((total.saturating_sub(idle)) as f64 * 100.0 / total as f64)
}

fn meminfo_kb(meminfo: &str, key: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|l| l.starts_with(key) && l[key.len()..].starts_with(':'))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|v| v.parse().ok())
}

fn memory_used_percent(meminfo: &str) -> Option<f64> {
    let total = meminfo_kb(meminfo, "MemTotal")?;
    let available = meminfo_kb(meminfo, "MemAvailable")?;
    if total == 0 {
        return None;
    }
    Some(total.saturating_sub(available) as f64 * 100.0 / total as f64)
}

fn parse_load_1m(loadavg: &str) -> Option<f64> {
    loadavg.split_whitespace().next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT_A: &str = "cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 50 0 50 350 50 0 0 0 0 0\n";
    const STAT_B: &str = "cpu  150 0 150 740 110 0 0 0 0 0\n";
    const MEMINFO: &str = "MemTotal:       1000 kB\nMemFree:         100 kB\nMemAvailable:    250 kB\n";

    #[test]
    fn test_cpu_busy_between_polls() {
        let a = parse_cpu_times(STAT_A).unwrap();
        let b = parse_cpu_times(STAT_B).unwrap();
        assert_eq!(a, CpuTimes { idle: 800, total: 1000 });
        // delta total 150, delta idle 50 -> 100/150 busy
        let busy = cpu_busy_percent(a, b).unwrap();
        assert!((busy - 66.666).abs() < 0.01);
    }

    #[test]
    fn test_memory_used_percent() {
        assert_eq!(memory_used_percent(MEMINFO), Some(75.0));
        assert_eq!(memory_used_percent("MemTotal: 10 kB\n"), None);
    }

    #[test]
    fn test_parse_load() {
        assert_eq!(parse_load_1m("0.42 0.30 0.20 1/200 1234\n"), Some(0.42));
    }

    #[tokio::test]
    async fn test_poll_from_fake_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stat"), STAT_A).unwrap();
        std::fs::write(dir.path().join("meminfo"), MEMINFO).unwrap();
        std::fs::write(dir.path().join("loadavg"), "1.5 1.0 0.5 1/100 1\n").unwrap();

        let mut poller = SystemPoller::with_root(dir.path());
        poller.open().await.unwrap();
        std::fs::write(dir.path().join("stat"), STAT_B).unwrap();

        let readings = poller.poll().await.unwrap();
        let names: Vec<&str> = readings.iter().map(|r| r.metric_name.as_str()).collect();
        assert_eq!(names, vec!["cpu_usage", "memory_usage", "load_1m"]);
    }

    #[tokio::test]
    async fn test_open_fails_without_procfs() {
        let dir = tempfile::tempdir().unwrap();
        let mut poller = SystemPoller::with_root(dir.path());
        assert!(matches!(poller.open().await, Err(SourceError::Io(_))));
    }
}
