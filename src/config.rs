//! Immutable startup configuration (SPEC_FULL.md §6).
//!
//! Loaded once from a YAML file and never mutated afterwards; passed by
//! reference (wrapped in an `Arc`) to the scheduler, monitor, and handler
//! rather than read from process-wide globals (see §9 "Global
//! configuration").

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::EdgeError;

/// Dispatch discipline selector (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[repr(u8)]
pub enum Strategy {
    Fifo = 0,
    FairByClient = 1,
    WeightedPriority = 2,
    WeightedPriorityFairByClient = 3,
}

impl TryFrom<u8> for Strategy {
    type Error = EdgeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Strategy::Fifo),
            1 => Ok(Strategy::FairByClient),
            2 => Ok(Strategy::WeightedPriority),
            3 => Ok(Strategy::WeightedPriorityFairByClient),
            other => Err(EdgeError::Configuration(format!(
                "STRATEGY must be 0..=3, got {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    pub host: String,
    pub port: u16,
    pub maxqueue: i64,
    pub portlower: u16,
    pub portupper: u16,
    pub maxcpu: i64,
    pub basecpu: i64,
    pub basemem: i64,
    pub cpuunit: i64,
    pub memunit: i64,
    pub strategy: u8,

    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,
    #[serde(default = "default_ssh_key_path")]
    pub ssh_key_path: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_idle_scan_interval", with = "humantime_serde")]
    pub idle_scan_interval: Duration,
    #[serde(default = "default_idle_sample_window", with = "humantime_serde")]
    pub idle_sample_window: Duration,
    #[serde(
        default = "default_termination_drain_interval",
        with = "humantime_serde"
    )]
    pub termination_drain_interval: Duration,
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(default = "default_key_read_timeout", with = "humantime_serde")]
    pub key_read_timeout: Duration,
    #[serde(default = "default_public_key_max_bytes")]
    pub public_key_max_bytes: usize,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("edge.db")
}
fn default_cert_dir() -> PathBuf {
    PathBuf::from("certs")
}
fn default_ssh_key_path() -> PathBuf {
    PathBuf::from("id_rsa.pub")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_idle_scan_interval() -> Duration {
    Duration::from_secs(120)
}
fn default_idle_sample_window() -> Duration {
    Duration::from_secs(10)
}
fn default_termination_drain_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_key_read_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_public_key_max_bytes() -> usize {
    16 * 1024
}

/// Fully validated, immutable configuration. `MAX_JOBS` is derived once at
/// startup per §4.3 and frozen here rather than recomputed on every loop
/// iteration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub max_queue: i64,
    pub port_lower: u16,
    pub port_upper: u16,
    pub max_cpu: i64,
    pub base_cpu: i64,
    pub base_mem: i64,
    pub cpu_unit: i64,
    pub mem_unit: i64,
    pub strategy: Strategy,
    pub max_jobs: u32,

    pub database_path: PathBuf,
    pub cert_dir: PathBuf,
    pub ssh_key_path: PathBuf,
    pub log_level: String,

    pub idle_scan_interval: Duration,
    pub idle_sample_window: Duration,
    pub termination_drain_interval: Duration,
    pub connect_timeout: Duration,
    pub key_read_timeout: Duration,
    pub public_key_max_bytes: usize,
}

impl Config {
    /// Reads and validates the configuration file, deriving `MAX_JOBS` from
    /// the host's reported core count and total memory (§4.3).
    pub fn load(path: &std::path::Path, cores: usize, total_mem_mib: i64) -> Result<Self, EdgeError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| EdgeError::Configuration(format!("reading {}: {e}", path.display())))?;
        let raw: RawConfig = serde_yaml::from_str(&text)
            .map_err(|e| EdgeError::Configuration(format!("parsing {}: {e}", path.display())))?;
        Self::from_raw(raw, cores, total_mem_mib)
    }

    pub fn from_raw(raw: RawConfig, cores: usize, total_mem_mib: i64) -> Result<Self, EdgeError> {
        let strategy = Strategy::try_from(raw.strategy)?;

        let max_cpu_jobs =
            ((raw.maxcpu * cores as i64) - raw.basecpu) / raw.cpuunit.max(1);
        let max_mem_jobs = (total_mem_mib - raw.basemem) / raw.memunit.max(1);
        let max_jobs = max_cpu_jobs.min(max_mem_jobs).max(0) as u32;

        Ok(Config {
            host: raw.host,
            port: raw.port,
            max_queue: raw.maxqueue,
            port_lower: raw.portlower,
            port_upper: raw.portupper,
            max_cpu: raw.maxcpu,
            base_cpu: raw.basecpu,
            base_mem: raw.basemem,
            cpu_unit: raw.cpuunit,
            mem_unit: raw.memunit,
            strategy,
            max_jobs,
            database_path: raw.database_path,
            cert_dir: raw.cert_dir,
            ssh_key_path: raw.ssh_key_path,
            log_level: raw.log_level,
            idle_scan_interval: raw.idle_scan_interval,
            idle_sample_window: raw.idle_sample_window,
            termination_drain_interval: raw.termination_drain_interval,
            connect_timeout: raw.connect_timeout,
            key_read_timeout: raw.key_read_timeout,
            public_key_max_bytes: raw.public_key_max_bytes,
        })
    }

    pub fn server_cert_path(&self) -> PathBuf {
        self.cert_dir.join("server.crt")
    }
    pub fn server_key_path(&self) -> PathBuf {
        self.cert_dir.join("server.key")
    }
    pub fn client_ca_bundle_path(&self) -> PathBuf {
        self.cert_dir.join("client.crt")
    }
    pub fn per_client_ca_path(&self, client_name: &str) -> PathBuf {
        self.cert_dir.join(format!("{client_name}.crt"))
    }
}

#[derive(Debug, Clone, clap::Parser)]
#[command(name = "edge-scheduler", about = "Fair-share job scheduler for an edge compute node")]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, env = "EDGE_CONFIG", default_value = "config.yaml")]
    pub config: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(strategy: u8) -> RawConfig {
        RawConfig {
            host: "0.0.0.0".into(),
            port: 9000,
            maxqueue: 10,
            portlower: 30000,
            portupper: 31000,
            maxcpu: 100,
            basecpu: 20,
            basemem: 512,
            cpuunit: 20,
            memunit: 256,
            strategy,
            database_path: default_database_path(),
            cert_dir: default_cert_dir(),
            ssh_key_path: default_ssh_key_path(),
            log_level: default_log_level(),
            idle_scan_interval: default_idle_scan_interval(),
            idle_sample_window: default_idle_sample_window(),
            termination_drain_interval: default_termination_drain_interval(),
            connect_timeout: default_connect_timeout(),
            key_read_timeout: default_key_read_timeout(),
            public_key_max_bytes: default_public_key_max_bytes(),
        }
    }

    #[test]
    fn derives_max_jobs_from_the_tighter_bound() {
        // cpu: (100*4 - 20)/20 = 19 ; mem: (2048-512)/256 = 6
        let cfg = Config::from_raw(raw(0), 4, 2048).unwrap();
        assert_eq!(cfg.max_jobs, 6);
    }

    #[test]
    fn rejects_bad_strategy() {
        assert!(Config::from_raw(raw(4), 4, 2048).is_err());
    }
}
