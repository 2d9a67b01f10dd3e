//! Process-wide controller configuration.

use std::time::Duration;

use crate::{
    Error, Result,
    repair::RepairBackoff,
    secret::{SecretGroup, SecretRef},
};

pub const INGRESS_CLASS_DEFAULT: &str = "argo-tunnel";
pub const RESYNC_PERIOD_DEFAULT: Duration = Duration::from_secs(10 * 60);
pub const WORKERS_DEFAULT: usize = 4;
pub const REPAIR_DELAY_DEFAULT: Duration = Duration::from_secs(1);
pub const REPAIR_JITTER_DEFAULT: f64 = 0.1;
pub const REPAIR_STEPS_DEFAULT: u32 = 7;
pub const TAG_LIMIT_DEFAULT: usize = 32;
pub const OPERATION_TIMEOUT_DEFAULT: Duration = Duration::from_secs(30);
pub const METRICS_INTERVAL_DEFAULT: Duration = Duration::from_secs(5);

///
/// Configuration handed to the engine once at construction. Nothing mutates it afterwards.
///
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Only Ingresses of this class get tunnels.
    pub ingress_class: String,
    /// Origin secret for hosts no secret group matches.
    pub default_secret: Option<SecretRef>,
    pub secret_groups: Vec<SecretGroup>,
    /// Period of the full resync that re-enqueues every known key.
    pub resync_period: Duration,
    /// Restrict watches to one namespace. `None` watches all namespaces.
    pub watch_namespace: Option<String>,
    pub workers: usize,
    pub repair: RepairBackoff,
    /// Maximum number of tags per tunnel.
    pub tag_limit: usize,
    /// Controller version, published as a tunnel tag.
    pub version: String,
    /// Upper bound for a single tunnel open or close call.
    pub operation_timeout: Duration,
    /// How often the metrics reporter samples engine state.
    pub metrics_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            ingress_class: INGRESS_CLASS_DEFAULT.to_string(),
            default_secret: None,
            secret_groups: Vec::new(),
            resync_period: RESYNC_PERIOD_DEFAULT,
            watch_namespace: None,
            workers: WORKERS_DEFAULT,
            repair: RepairBackoff {
                delay: REPAIR_DELAY_DEFAULT,
                jitter: REPAIR_JITTER_DEFAULT,
                steps: REPAIR_STEPS_DEFAULT,
            },
            tag_limit: TAG_LIMIT_DEFAULT,
            version: env!("CARGO_PKG_VERSION").to_string(),
            operation_timeout: OPERATION_TIMEOUT_DEFAULT,
            metrics_interval: METRICS_INTERVAL_DEFAULT,
        }
    }
}

impl ControllerConfig {
    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.ingress_class.trim().is_empty() {
            return Err(Error::ConfigError("ingress class must not be empty".into()));
        }
        if self.workers == 0 {
            return Err(Error::ConfigError("at least one worker is required".into()));
        }
        if !(0.0..1.0).contains(&self.repair.jitter) {
            return Err(Error::ConfigError(format!(
                "repair jitter must be in [0, 1), got {}",
                self.repair.jitter
            )));
        }
        if self.repair.steps == 0 {
            return Err(Error::ConfigError("repair steps must be at least 1".into()));
        }
        if self.repair.delay.is_zero() {
            return Err(Error::ConfigError("repair delay must be positive".into()));
        }
        for (name, period) in [
            ("resync period", self.resync_period),
            ("operation timeout", self.operation_timeout),
            ("metrics interval", self.metrics_interval),
        ] {
            if period.is_zero() {
                return Err(Error::ConfigError(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}

///
/// Parses a Go-style duration such as `1500ms`, `30s`, `10m`, `1h` or `1m30s`.
///
pub fn parse_duration(input: &str) -> Result<Duration> {
    let invalid = || Error::ConfigError(format!("invalid duration `{input}`"));
    let mut rest = input.trim();
    if rest.is_empty() {
        return Err(invalid());
    }
    if rest == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        let value: f64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let seconds = match &rest[..unit_len] {
            "ms" => value / 1000.0,
            "s" => value,
            "m" => value * 60.0,
            "h" => value * 3600.0,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];
        total += Duration::try_from_secs_f64(seconds).map_err(|_| invalid())?;
    }
    Ok(total)
}
