//! Best-effort system and accelerator telemetry probes.
//!
//! Probes return `Ok(None)` when the resource simply is not present (no GPU,
//! no driver tooling) and `Err` when it is present but could not be read.
//! Callers treat both as "field absent"; errors are only logged.

use std::{
    fs,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    process::Command,
    sync::Mutex,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AcceleratorStats {
    /// Utilisation in percent.
    #[serde(rename = "gpu_load")]
    pub load: f64,
    /// Megabytes.
    #[serde(rename = "gpu_memory_used")]
    pub memory_used: f64,
    /// Megabytes.
    #[serde(rename = "gpu_memory_total")]
    pub memory_total: f64,
    /// Degrees Celsius.
    #[serde(rename = "gpu_temperature")]
    pub temperature: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    /// Megabytes.
    pub memory_available: f64,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("{command} failed: {detail}")]
    Failed { command: &'static str, detail: String },
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("malformed {what}: {detail}")]
    Parse { what: &'static str, detail: String },
}

pub trait AcceleratorProbe: Send + Sync {
    fn sample(&self) -> Result<Option<AcceleratorStats>, ProbeError>;
}

pub trait SystemProbe: Send + Sync {
    fn sample(&self) -> Result<Option<SystemStats>, ProbeError>;
}

impl<F> AcceleratorProbe for F
where
    F: Fn() -> Result<Option<AcceleratorStats>, ProbeError> + Send + Sync,
{
    fn sample(&self) -> Result<Option<AcceleratorStats>, ProbeError> {
        self()
    }
}

impl<F> SystemProbe for F
where
    F: Fn() -> Result<Option<SystemStats>, ProbeError> + Send + Sync,
{
    fn sample(&self) -> Result<Option<SystemStats>, ProbeError> {
        self()
    }
}

const NVIDIA_SMI: &str = "nvidia-smi";

/// Samples the first GPU reported by `nvidia-smi`.
#[derive(Debug, Default)]
pub struct NvidiaSmiProbe;

impl AcceleratorProbe for NvidiaSmiProbe {
    fn sample(&self) -> Result<Option<AcceleratorStats>, ProbeError> {
        let output = match Command::new(NVIDIA_SMI)
            .arg("--query-gpu=utilization.gpu,memory.used,memory.total,temperature.gpu")
            .arg("--format=csv,noheader,nounits")
            .output()
        {
            Ok(output) => output,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ProbeError::Spawn {
                    command: NVIDIA_SMI,
                    source,
                });
            }
        };

        if !output.status.success() {
            return Err(ProbeError::Failed {
                command: NVIDIA_SMI,
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        parse_nvidia_smi_csv(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse `load, mem_used, mem_total, temperature` from the first CSV row.
pub(crate) fn parse_nvidia_smi_csv(text: &str) -> Result<Option<AcceleratorStats>, ProbeError> {
    let Some(line) = text.lines().map(str::trim).find(|line| !line.is_empty()) else {
        return Ok(None);
    };
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 4 {
        return Err(ProbeError::Parse {
            what: "nvidia-smi output",
            detail: format!("expected 4 fields, got {line:?}"),
        });
    }
    let parse = |value: &str| {
        value.parse::<f64>().map_err(|_| ProbeError::Parse {
            what: "nvidia-smi output",
            detail: format!("not a number: {value:?}"),
        })
    };
    Ok(Some(AcceleratorStats {
        load: parse(fields[0])?,
        memory_used: parse(fields[1])?,
        memory_total: parse(fields[2])?,
        temperature: parse(fields[3])?,
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

/// CPU and memory usage from procfs.
///
/// CPU utilisation is the busy share between two consecutive samples, so the
/// first sample reports `0.0`.
#[derive(Debug)]
pub struct ProcSystemProbe {
    stat_path: PathBuf,
    meminfo_path: PathBuf,
    last_cpu: Mutex<Option<CpuTimes>>,
}

impl Default for ProcSystemProbe {
    fn default() -> Self {
        Self::with_paths("/proc/stat", "/proc/meminfo")
    }
}

impl ProcSystemProbe {
    pub fn with_paths(stat_path: impl Into<PathBuf>, meminfo_path: impl Into<PathBuf>) -> Self {
        Self {
            stat_path: stat_path.into(),
            meminfo_path: meminfo_path.into(),
            last_cpu: Mutex::new(None),
        }
    }

    fn read(path: &Path) -> Result<String, ProbeError> {
        fs::read_to_string(path).map_err(|source| ProbeError::Read {
            path: path.display().to_string(),
            source,
        })
    }
}

impl SystemProbe for ProcSystemProbe {
    fn sample(&self) -> Result<Option<SystemStats>, ProbeError> {
        let cpu = parse_cpu_times(&Self::read(&self.stat_path)?)?;
        let (total_kb, available_kb) = parse_meminfo(&Self::read(&self.meminfo_path)?)?;

        let cpu_percent = {
            let mut last = self
                .last_cpu
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let percent = match *last {
                Some(previous) => cpu_busy_percent(previous, cpu),
                None => 0.0,
            };
            *last = Some(cpu);
            percent
        };

        let memory_percent = if total_kb == 0 {
            0.0
        } else {
            (total_kb.saturating_sub(available_kb)) as f64 / total_kb as f64 * 100.0
        };

        Ok(Some(SystemStats {
            cpu_percent,
            memory_percent,
            memory_available: available_kb as f64 / 1024.0,
        }))
    }
}

fn cpu_busy_percent(previous: CpuTimes, current: CpuTimes) -> f64 {
    let total = current.total.saturating_sub(previous.total);
    if total == 0 {
        return 0.0;
    }
    let idle = current.idle.saturating_sub(previous.idle).min(total);
    (total - idle) as f64 / total as f64 * 100.0
}

fn parse_cpu_times(stat: &str) -> Result<CpuTimes, ProbeError> {
    let line = stat
        .lines()
        .find(|line| line.starts_with("cpu "))
        .ok_or_else(|| ProbeError::Parse {
            what: "/proc/stat",
            detail: "missing aggregate cpu line".to_string(),
        })?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(|field| field.parse::<u64>())
        .collect::<Result<_, _>>()
        .map_err(|err| ProbeError::Parse {
            what: "/proc/stat",
            detail: err.to_string(),
        })?;
    if values.len() < 4 {
        return Err(ProbeError::Parse {
            what: "/proc/stat",
            detail: format!("expected at least 4 cpu fields, got {}", values.len()),
        });
    }
    // user nice system idle iowait irq softirq steal
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Ok(CpuTimes {
        idle,
        total: values.iter().sum(),
    })
}

/// Returns `(MemTotal, MemAvailable)` in kB.
fn parse_meminfo(meminfo: &str) -> Result<(u64, u64), ProbeError> {
    let mut total = None;
    let mut available = None;
    for line in meminfo.lines() {
        let mut parts = line.split_whitespace();
        let key = parts.next();
        let value = parts.next().and_then(|v| v.parse::<u64>().ok());
        match key {
            Some("MemTotal:") => total = value,
            Some("MemAvailable:") => available = value,
            _ => {}
        }
    }
    match (total, available) {
        (Some(total), Some(available)) => Ok((total, available)),
        _ => Err(ProbeError::Parse {
            what: "/proc/meminfo",
            detail: "missing MemTotal or MemAvailable".to_string(),
        }),
    }
}
