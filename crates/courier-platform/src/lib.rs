use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use thiserror::Error;

const PROC_MEMINFO_PATH: &str = "/proc/meminfo";
const PROC_SELF_STATUS_PATH: &str = "/proc/self/status";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryProbeError {
    #[error("memory statistics unavailable: {0}")]
    Unavailable(String),
    #[error("malformed memory statistics: {0}")]
    Malformed(String),
    #[error("memory probe backend failure: {0}")]
    Backend(String),
}

/// One observation of memory usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySample {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

impl MemorySample {
    pub fn new(used_bytes: u64, total_bytes: u64) -> Self {
        Self {
            used_bytes,
            total_bytes,
        }
    }

    /// Fraction of `total_bytes` currently in use; `0.0` when the total is unknown.
    pub fn usage_ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.total_bytes as f64
    }
}

pub trait MemoryProbe: Send + Sync {
    fn sample(&self) -> Result<MemorySample, MemoryProbeError>;
}

/// Reads system-wide usage from `/proc/meminfo` (`MemTotal - MemAvailable`).
///
/// Reacts to memory used by every process on the machine; prefer
/// [`ProcessMemoryProbe`] unless that is what you want.
#[derive(Debug, Clone)]
pub struct ProcMeminfoProbe {
    path: PathBuf,
}

impl Default for ProcMeminfoProbe {
    fn default() -> Self {
        Self::with_path(PROC_MEMINFO_PATH)
    }
}

impl ProcMeminfoProbe {
    pub fn with_path(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl MemoryProbe for ProcMeminfoProbe {
    fn sample(&self) -> Result<MemorySample, MemoryProbeError> {
        parse_meminfo(&read_stats(&self.path)?)
    }
}

/// Reads this process's resident set (`VmRSS` of `/proc/self/status`) and
/// measures it against a memory budget.
///
/// Without an explicit budget the machine's `MemTotal` is used, so the ratio
/// only moves when this process grows.
#[derive(Debug, Clone)]
pub struct ProcessMemoryProbe {
    status_path: PathBuf,
    meminfo_path: PathBuf,
    budget_bytes: Option<u64>,
}

impl Default for ProcessMemoryProbe {
    fn default() -> Self {
        Self::with_paths(PROC_SELF_STATUS_PATH, PROC_MEMINFO_PATH)
    }
}

impl ProcessMemoryProbe {
    pub fn with_paths(status_path: impl AsRef<Path>, meminfo_path: impl AsRef<Path>) -> Self {
        Self {
            status_path: status_path.as_ref().to_path_buf(),
            meminfo_path: meminfo_path.as_ref().to_path_buf(),
            budget_bytes: None,
        }
    }

    /// Measure against `budget_bytes` instead of `MemTotal`; zero clears it.
    pub fn with_budget(mut self, budget_bytes: u64) -> Self {
        self.budget_bytes = (budget_bytes > 0).then_some(budget_bytes);
        self
    }

    pub fn budget_bytes(&self) -> Option<u64> {
        self.budget_bytes
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn sample(&self) -> Result<MemorySample, MemoryProbeError> {
        let used_bytes = parse_vm_rss(&read_stats(&self.status_path)?)?;
        let total_bytes = match self.budget_bytes {
            Some(budget) => budget,
            None => parse_meminfo(&read_stats(&self.meminfo_path)?)?.total_bytes,
        };
        Ok(MemorySample::new(used_bytes, total_bytes))
    }
}

fn read_stats(path: &Path) -> Result<String, MemoryProbeError> {
    fs::read_to_string(path)
        .map_err(|err| MemoryProbeError::Unavailable(format!("{}: {err}", path.display())))
}

/// Resident set size in bytes from a `/proc/<pid>/status` document.
pub fn parse_vm_rss(raw: &str) -> Result<u64, MemoryProbeError> {
    let [rss_kb] = read_kb_fields(raw, ["VmRSS"])?;
    let rss_kb = rss_kb.ok_or_else(|| MemoryProbeError::Malformed("missing VmRSS".to_owned()))?;
    Ok(rss_kb.saturating_mul(1024))
}

/// Values (in kB) of the `Key:   value kB` lines named in `keys`.
fn read_kb_fields<const N: usize>(
    raw: &str,
    keys: [&str; N],
) -> Result<[Option<u64>; N], MemoryProbeError> {
    let mut values = [None; N];
    for line in raw.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let Some(index) = keys.iter().position(|wanted| *wanted == key) else {
            continue;
        };
        let value = rest
            .split_whitespace()
            .next()
            .ok_or_else(|| MemoryProbeError::Malformed(format!("{key} has no value")))?;
        let parsed = value
            .parse::<u64>()
            .map_err(|err| MemoryProbeError::Malformed(format!("{key}='{value}': {err}")))?;
        values[index] = Some(parsed);
    }
    Ok(values)
}

/// Parse the `MemTotal`/`MemAvailable` lines of a meminfo document.
pub fn parse_meminfo(raw: &str) -> Result<MemorySample, MemoryProbeError> {
    let [total_kb, available_kb] = read_kb_fields(raw, ["MemTotal", "MemAvailable"])?;

    let total_kb =
        total_kb.ok_or_else(|| MemoryProbeError::Malformed("missing MemTotal".to_owned()))?;
    let available_kb = available_kb
        .ok_or_else(|| MemoryProbeError::Malformed("missing MemAvailable".to_owned()))?;

    let total_bytes = total_kb.saturating_mul(1024);
    let used_bytes = total_kb.saturating_sub(available_kb).saturating_mul(1024);
    Ok(MemorySample::new(used_bytes, total_bytes))
}

/// Probe returning a caller-controlled sample; shared clones observe updates.
#[derive(Clone, Default)]
pub struct FixedMemoryProbe {
    sample: Arc<RwLock<Option<MemorySample>>>,
}

impl FixedMemoryProbe {
    pub fn new(used_bytes: u64, total_bytes: u64) -> Self {
        let probe = Self::default();
        probe.set(used_bytes, total_bytes);
        probe
    }

    pub fn set(&self, used_bytes: u64, total_bytes: u64) {
        if let Ok(mut slot) = self.sample.write() {
            *slot = Some(MemorySample::new(used_bytes, total_bytes));
        }
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.sample.write() {
            *slot = None;
        }
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn sample(&self) -> Result<MemorySample, MemoryProbeError> {
        let slot = self
            .sample
            .read()
            .map_err(|_| MemoryProbeError::Backend("poisoned lock".to_owned()))?;
        slot.ok_or_else(|| MemoryProbeError::Unavailable("no sample recorded".to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMINFO: &str = "MemTotal:       16000000 kB\n\
                           MemFree:         1000000 kB\n\
                           MemAvailable:    4000000 kB\n\
                           Buffers:          200000 kB\n";

    #[test]
    fn parses_total_and_available() {
        let sample = parse_meminfo(MEMINFO).expect("meminfo should parse");
        assert_eq!(sample.total_bytes, 16_000_000 * 1024);
        assert_eq!(sample.used_bytes, 12_000_000 * 1024);
        assert!((sample.usage_ratio() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_meminfo_without_available_line() {
        let err = parse_meminfo("MemTotal: 100 kB\n").expect_err("must fail");
        assert_eq!(
            err,
            MemoryProbeError::Malformed("missing MemAvailable".to_owned())
        );
    }

    #[test]
    fn rejects_non_numeric_values() {
        let err = parse_meminfo("MemTotal: lots kB\nMemAvailable: 1 kB\n").expect_err("must fail");
        assert!(matches!(err, MemoryProbeError::Malformed(_)));
    }

    #[test]
    fn missing_file_is_unavailable() {
        let probe = ProcMeminfoProbe::with_path("/definitely/not/here/meminfo");
        assert!(matches!(
            probe.sample(),
            Err(MemoryProbeError::Unavailable(_))
        ));
    }

    const STATUS: &str = "Name:\tcourier-smoke\n\
                          VmPeak:\t  300000 kB\n\
                          VmRSS:\t  120000 kB\n\
                          Threads:\t4\n";

    fn write_fixture(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "courier-platform-{}-{name}",
            std::process::id()
        ));
        fs::write(&path, contents).expect("fixture should be writable");
        path
    }

    #[test]
    fn parses_resident_set_size() {
        assert_eq!(parse_vm_rss(STATUS), Ok(120_000 * 1024));
        assert_eq!(
            parse_vm_rss("Name: x\n"),
            Err(MemoryProbeError::Malformed("missing VmRSS".to_owned()))
        );
    }

    #[test]
    fn process_probe_measures_rss_against_machine_total() {
        let status = write_fixture("status-total", STATUS);
        let meminfo = write_fixture("meminfo-total", MEMINFO);
        let probe = ProcessMemoryProbe::with_paths(&status, &meminfo);

        let sample = probe.sample().expect("fixtures should parse");
        assert_eq!(sample.used_bytes, 120_000 * 1024);
        assert_eq!(sample.total_bytes, 16_000_000 * 1024);

        fs::remove_file(status).ok();
        fs::remove_file(meminfo).ok();
    }

    #[test]
    fn process_probe_prefers_configured_budget() {
        let status = write_fixture("status-budget", STATUS);
        let probe = ProcessMemoryProbe::with_paths(&status, "/definitely/not/here/meminfo")
            .with_budget(150_000 * 1024);
        assert_eq!(probe.budget_bytes(), Some(150_000 * 1024));

        let sample = probe.sample().expect("budget replaces meminfo");
        assert!((sample.usage_ratio() - 0.8).abs() < 1e-9);
        assert_eq!(ProcessMemoryProbe::default().with_budget(0).budget_bytes(), None);

        fs::remove_file(status).ok();
    }

    #[test]
    fn process_probe_without_status_is_unavailable() {
        let probe = ProcessMemoryProbe::with_paths("/definitely/not/here/status", PROC_MEMINFO_PATH);
        assert!(matches!(
            probe.sample(),
            Err(MemoryProbeError::Unavailable(_))
        ));
    }

    #[test]
    fn zero_total_reports_zero_ratio() {
        assert_eq!(MemorySample::new(10, 0).usage_ratio(), 0.0);
    }

    #[test]
    fn fixed_probe_shares_updates_between_clones() {
        let probe = FixedMemoryProbe::default();
        let observer = probe.clone();
        assert!(observer.sample().is_err());

        probe.set(90, 100);
        let sample = observer.sample().expect("sample should be recorded");
        assert_eq!(sample, MemorySample::new(90, 100));

        probe.clear();
        assert!(observer.sample().is_err());
    }
}
