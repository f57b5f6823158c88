//! Capacity and overhead arithmetic for instance types
//!
//! Quantities are stringly-typed at the Kubernetes API boundary only; inside
//! the provider everything is integer math: milli-CPU, bytes, and counts.
//! This keeps the kube-reserved and eviction-threshold rules exact and easy
//! to verify against reference values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Eviction signal name for available memory
pub const MEMORY_AVAILABLE: &str = "memory.available";
/// Eviction signal name for available node filesystem space
pub const NODEFS_AVAILABLE: &str = "nodefs.available";

const KIB: i64 = 1024;
const MIB: i64 = 1024 * KIB;
const GIB: i64 = 1024 * MIB;
const TIB: i64 = 1024 * GIB;

/// Node capacity as projected onto a NodeClaim
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// CPU in milli-cores
    pub cpu_milli: i64,
    /// Memory in bytes
    pub memory_bytes: i64,
    /// Local ephemeral storage in bytes
    pub ephemeral_bytes: i64,
    /// Schedulable pod count
    pub pods: i64,
    /// NVIDIA GPU count
    pub nvidia_gpus: i64,
    /// AMD GPU count
    pub amd_gpus: i64,
    /// Assignable private IPv4 addresses across all ENIs
    pub private_ipv4: i64,
}

/// A reservation subtracted from capacity (kube-reserved, system-reserved,
/// or an eviction threshold)
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reserved {
    /// CPU in milli-cores
    pub cpu_milli: i64,
    /// Memory in bytes
    pub memory_bytes: i64,
    /// Ephemeral storage in bytes
    pub ephemeral_bytes: i64,
}

/// The three reservations carried by every instance type
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overhead {
    /// Reserved for kubelet and container runtime
    pub kube_reserved: Reserved,
    /// Reserved for OS daemons, verbatim from configuration
    pub system_reserved: Reserved,
    /// Headroom claimed by the kubelet eviction manager
    pub eviction_threshold: Reserved,
}

impl Overhead {
    /// Sum of all three reservations
    pub fn total(&self) -> Reserved {
        Reserved {
            cpu_milli: self.kube_reserved.cpu_milli
                + self.system_reserved.cpu_milli
                + self.eviction_threshold.cpu_milli,
            memory_bytes: self.kube_reserved.memory_bytes
                + self.system_reserved.memory_bytes
                + self.eviction_threshold.memory_bytes,
            ephemeral_bytes: self.kube_reserved.ephemeral_bytes
                + self.system_reserved.ephemeral_bytes
                + self.eviction_threshold.ephemeral_bytes,
        }
    }
}

impl Resources {
    /// Capacity remaining after deducting the overhead
    pub fn allocatable(&self, overhead: &Overhead) -> Resources {
        let total = overhead.total();
        Resources {
            cpu_milli: (self.cpu_milli - total.cpu_milli).max(0),
            memory_bytes: (self.memory_bytes - total.memory_bytes).max(0),
            ephemeral_bytes: (self.ephemeral_bytes - total.ephemeral_bytes).max(0),
            ..self.clone()
        }
    }

    /// Render as a Kubernetes resource list, omitting zero values
    pub fn to_quantity_map(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        if self.cpu_milli != 0 {
            out.insert("cpu".to_string(), format_cpu_milli(self.cpu_milli));
        }
        if self.memory_bytes != 0 {
            out.insert("memory".to_string(), format_bytes(self.memory_bytes));
        }
        if self.ephemeral_bytes != 0 {
            out.insert(
                "ephemeral-storage".to_string(),
                format_bytes(self.ephemeral_bytes),
            );
        }
        if self.pods != 0 {
            out.insert("pods".to_string(), self.pods.to_string());
        }
        if self.nvidia_gpus != 0 {
            out.insert("nvidia.com/gpu".to_string(), self.nvidia_gpus.to_string());
        }
        if self.amd_gpus != 0 {
            out.insert("amd.com/gpu".to_string(), self.amd_gpus.to_string());
        }
        if self.private_ipv4 != 0 {
            out.insert(
                "vpc.k8s.alibabacloud/private-ipv4-address".to_string(),
                self.private_ipv4.to_string(),
            );
        }
        out
    }
}

/// Parse a Kubernetes byte quantity (`512Mi`, `1.5Gi`, `20G`, `1073741824`)
pub fn parse_bytes(s: &str) -> Result<i64> {
    let s = s.trim();
    let (number, multiplier) = split_suffix(s)?;
    let value: f64 = number
        .parse()
        .map_err(|_| Error::validation(format!("invalid quantity {s:?}")))?;
    Ok((value * multiplier as f64).ceil() as i64)
}

/// Parse a CPU quantity into milli-cores (`2` -> 2000, `100m` -> 100)
pub fn parse_cpu_milli(s: &str) -> Result<i64> {
    let s = s.trim();
    if let Some(milli) = s.strip_suffix('m') {
        return milli
            .parse::<i64>()
            .map_err(|_| Error::validation(format!("invalid cpu quantity {s:?}")));
    }
    let cores: f64 = s
        .parse()
        .map_err(|_| Error::validation(format!("invalid cpu quantity {s:?}")))?;
    Ok((cores * 1000.0).round() as i64)
}

/// Parse a percentage signal value (`5%` -> 5.0)
///
/// A value of 100% disables the threshold per upstream kubelet semantics, so
/// it parses to zero.
pub fn parse_percentage(s: &str) -> Result<f64> {
    let trimmed = s.trim_end_matches('%');
    let p: f64 = trimmed
        .parse()
        .map_err(|_| Error::validation(format!("invalid percentage {s:?}")))?;
    Ok(if p == 100.0 { 0.0 } else { p })
}

fn split_suffix(s: &str) -> Result<(&str, i64)> {
    for (suffix, multiplier) in [
        ("Ki", KIB),
        ("Mi", MIB),
        ("Gi", GIB),
        ("Ti", TIB),
        ("k", 1000),
        ("K", 1000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
    ] {
        if let Some(number) = s.strip_suffix(suffix) {
            return Ok((number, multiplier));
        }
    }
    if s.is_empty() {
        return Err(Error::validation("empty quantity"));
    }
    Ok((s, 1))
}

/// Render bytes with the largest exact binary suffix
pub fn format_bytes(bytes: i64) -> String {
    if bytes != 0 && bytes % GIB == 0 {
        format!("{}Gi", bytes / GIB)
    } else if bytes != 0 && bytes % MIB == 0 {
        format!("{}Mi", bytes / MIB)
    } else if bytes != 0 && bytes % KIB == 0 {
        format!("{}Ki", bytes / KIB)
    } else {
        bytes.to_string()
    }
}

/// Render milli-cores, collapsing to whole cores when exact
pub fn format_cpu_milli(milli: i64) -> String {
    if milli % 1000 == 0 {
        (milli / 1000).to_string()
    } else {
        format!("{milli}m")
    }
}

/// CPU reserved for the kubelet, tiered by core count
///
/// 6% of the first core, 1% of the next, 0.5% of the following two, and
/// 0.25% of everything beyond four cores.
pub fn kube_reserved_cpu_milli(cpu_milli: i64) -> i64 {
    let mut reserved = 0.0;
    for (start, end, percentage) in [
        (0i64, 1000i64, 0.06),
        (1000, 2000, 0.01),
        (2000, 4000, 0.005),
        (4000, i64::MAX, 0.0025),
    ] {
        if cpu_milli >= start {
            let range = (cpu_milli.min(end) - start) as f64;
            reserved += range * percentage;
        }
    }
    reserved as i64
}

/// Compute the kube-reserved reservation for an instance type
///
/// Memory follows `(11 * pods + 255) MiB`, ephemeral storage defaults to
/// 1 GiB, and CPU follows the tier rule. User-provided entries override the
/// computed values per key.
pub fn kube_reserved(
    cpu_milli: i64,
    pods: i64,
    overrides: Option<&BTreeMap<String, String>>,
) -> Result<Reserved> {
    let mut reserved = Reserved {
        cpu_milli: kube_reserved_cpu_milli(cpu_milli),
        memory_bytes: (11 * pods + 255) * MIB,
        ephemeral_bytes: GIB,
    };
    if let Some(overrides) = overrides {
        apply_reserved_overrides(&mut reserved, overrides)?;
    }
    Ok(reserved)
}

/// Build the system-reserved reservation verbatim from configuration
pub fn system_reserved(config: Option<&BTreeMap<String, String>>) -> Result<Reserved> {
    let mut reserved = Reserved::default();
    if let Some(config) = config {
        apply_reserved_overrides(&mut reserved, config)?;
    }
    Ok(reserved)
}

fn apply_reserved_overrides(
    reserved: &mut Reserved,
    entries: &BTreeMap<String, String>,
) -> Result<()> {
    for (key, value) in entries {
        match key.as_str() {
            "cpu" => reserved.cpu_milli = parse_cpu_milli(value)?,
            "memory" => reserved.memory_bytes = parse_bytes(value)?,
            "ephemeral-storage" => reserved.ephemeral_bytes = parse_bytes(value)?,
            // pid reservations don't map onto node resources
            _ => {}
        }
    }
    Ok(())
}

/// Compute the eviction threshold reservation
///
/// The result is the maximum of a 100 MiB memory / 10%-of-disk base and the
/// strictest configured hard/soft signal. Percentage signals apply against
/// the capacity passed in; plain quantities are taken verbatim.
pub fn eviction_threshold(
    memory_bytes: i64,
    ephemeral_bytes: i64,
    eviction_hard: Option<&BTreeMap<String, String>>,
    eviction_soft: Option<&BTreeMap<String, String>>,
) -> Result<Reserved> {
    let mut threshold = Reserved {
        cpu_milli: 0,
        memory_bytes: 100 * MIB,
        ephemeral_bytes: ((ephemeral_bytes as f64) * 0.10).ceil() as i64,
    };

    for signals in [eviction_hard, eviction_soft].into_iter().flatten() {
        if let Some(value) = signals.get(MEMORY_AVAILABLE) {
            threshold.memory_bytes = threshold
                .memory_bytes
                .max(compute_eviction_signal(memory_bytes, value)?);
        }
        if let Some(value) = signals.get(NODEFS_AVAILABLE) {
            threshold.ephemeral_bytes = threshold
                .ephemeral_bytes
                .max(compute_eviction_signal(ephemeral_bytes, value)?);
        }
    }
    Ok(threshold)
}

fn compute_eviction_signal(capacity: i64, signal_value: &str) -> Result<i64> {
    if signal_value.ends_with('%') {
        let p = parse_percentage(signal_value)?;
        Ok(((capacity as f64) / 100.0 * p).ceil() as i64)
    } else {
        parse_bytes(signal_value)
    }
}
