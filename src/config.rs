use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use segment_bus::JobId;

pub const SEGMENT_ADDRESS: &str = "RELAY_SEGMENT_ADDRESS";
pub const LISTEN_ADDRESS: &str = "RELAY_LISTEN_ADDRESS";
pub const JOB_ID: &str = "RELAY_JOB_ID";
pub const SEGMENT_FRAMES: &str = "RELAY_SEGMENT_FRAMES";
pub const UNPACKER_WORKERS: &str = "RELAY_UNPACKER_WORKERS";
pub const CACHE_TTL_SECS: &str = "RELAY_CACHE_TTL_SECS";
pub const CACHE_SWEEP_SECS: &str = "RELAY_CACHE_SWEEP_SECS";
pub const OUTPUT_FORMAT: &str = "RELAY_OUTPUT_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Send,
    Recv,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    segment_address: Option<String>,
    listen_address: Option<String>,
    job_id: Option<JobId>,
    segment_frames: usize,
    unpacker_workers: usize,
    cache_ttl: Duration,
    cache_sweep: Duration,
    output_format: String,
}

impl RelayConfig {
    /// Reads every setting through `lookup`. Fails listing every required
    /// setting `role` needs that is missing.
    pub fn resolve<F>(role: Role, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let required: &[&str] = match role {
            Role::Send => &[SEGMENT_ADDRESS],
            Role::Recv => &[LISTEN_ADDRESS],
        };
        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|name| value(name).is_none())
            .collect();
        if !missing.is_empty() {
            bail!("missing required settings: {}", missing.join(", "));
        }

        let job_id = match value(JOB_ID) {
            Some(raw) => Some(parse::<JobId>(JOB_ID, &raw)?),
            None => None,
        };
        let number = |name: &str, default: u64| -> Result<u64> {
            value(name).map_or(Ok(default), |raw| parse(name, &raw))
        };

        Ok(Self {
            segment_address: value(SEGMENT_ADDRESS),
            listen_address: value(LISTEN_ADDRESS),
            job_id,
            segment_frames: number(SEGMENT_FRAMES, 250)? as usize,
            unpacker_workers: number(UNPACKER_WORKERS, 1)? as usize,
            cache_ttl: Duration::from_secs(number(CACHE_TTL_SECS, 600)?),
            cache_sweep: Duration::from_secs(number(CACHE_SWEEP_SECS, 10)?),
            output_format: value(OUTPUT_FORMAT).unwrap_or_else(|| "matroska".to_string()),
        })
    }

    pub fn segment_address(&self) -> &str {
        self.segment_address.as_deref().unwrap_or_default()
    }

    pub fn listen_address(&self) -> &str {
        self.listen_address.as_deref().unwrap_or_default()
    }

    pub fn job_id(&self) -> Option<JobId> {
        self.job_id
    }

    pub fn segment_frames(&self) -> usize {
        self.segment_frames
    }

    pub fn unpacker_workers(&self) -> usize {
        self.unpacker_workers
    }

    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    pub fn cache_sweep(&self) -> Duration {
        self.cache_sweep
    }

    pub fn output_format(&self) -> &str {
        &self.output_format
    }
}

fn parse<T: FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| anyhow!("invalid value for {name}: {raw:?}"))
}

static CONFIG: OnceLock<RelayConfig> = OnceLock::new();

/// Resolves the process configuration from the environment. Only the first
/// call has any effect.
pub fn load(role: Role) -> Result<&'static RelayConfig> {
    if let Some(config) = CONFIG.get() {
        return Ok(config);
    }
    let config = RelayConfig::resolve(role, |name| std::env::var(name).ok())?;
    Ok(CONFIG.get_or_init(|| config))
}

pub fn config() -> Result<&'static RelayConfig> {
    CONFIG
        .get()
        .ok_or_else(|| anyhow!("configuration has not been loaded"))
}
