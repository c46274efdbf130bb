//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (sizes ordered, fractions in range, ports valid)
//! - Check candidate addresses and certificate pins parse
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: FrontConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::IpAddr;

use crate::config::schema::FrontConfig;
use crate::net::cert::decode_pin;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &FrontConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    for ip in &config.candidates.ips {
        if ip.parse::<IpAddr>().is_err() {
            errors.push(ValidationError::new(
                "candidates.ips",
                format!("not an IP address: {ip}"),
            ));
        }
    }
    if config.candidates.port == 0 {
        errors.push(ValidationError::new("candidates.port", "must be non-zero"));
    }
    if config.candidates.sni.iter().any(|s| s.trim().is_empty()) {
        errors.push(ValidationError::new("candidates.sni", "empty server name"));
    }

    if config.tls.connect_timeout_ms == 0 {
        errors.push(ValidationError::new("tls.connect_timeout_ms", "must be > 0"));
    }
    for pin in &config.tls.pinned_intermediates {
        if decode_pin(pin).is_none() {
            errors.push(ValidationError::new(
                "tls.pinned_intermediates",
                format!("not a base64 SHA-256 digest: {pin}"),
            ));
        }
    }

    if config.tracker.max_in_flight_per_ip == 0 {
        errors.push(ValidationError::new("tracker.max_in_flight_per_ip", "must be > 0"));
    }
    if config.tracker.history_len == 0 {
        errors.push(ValidationError::new("tracker.history_len", "must be > 0"));
    }

    if config.pool.min_size > config.pool.max_size {
        errors.push(ValidationError::new(
            "pool.min_size",
            format!(
                "min_size {} exceeds max_size {}",
                config.pool.min_size, config.pool.max_size
            ),
        ));
    }
    if config.pool.max_size > 0 && config.pool.max_connect_attempts == 0 {
        errors.push(ValidationError::new(
            "pool.max_connect_attempts",
            "must be > 0 when max_size > 0",
        ));
    }
    if config.pool.backoff_base_ms > config.pool.backoff_max_ms {
        errors.push(ValidationError::new(
            "pool.backoff_base_ms",
            "must not exceed backoff_max_ms",
        ));
    }

    if config.worker.http2_max_streams == 0 {
        errors.push(ValidationError::new("worker.http2_max_streams", "must be > 0"));
    }
    if config.worker.max_ping_failures == 0 {
        errors.push(ValidationError::new("worker.max_ping_failures", "must be > 0"));
    }

    let d = &config.dispatcher;
    if !(0.0..=1.0).contains(&d.idle_fraction) {
        errors.push(ValidationError::new(
            "dispatcher.idle_fraction",
            "must be within [0, 1]",
        ));
    }
    if d.good_score > d.unusable_score {
        errors.push(ValidationError::new(
            "dispatcher.good_score",
            "must not exceed unusable_score",
        ));
    }
    if d.min_workers > d.max_workers {
        errors.push(ValidationError::new(
            "dispatcher.min_workers",
            "must not exceed max_workers",
        ));
    }
    if d.max_pending_tasks == 0 {
        errors.push(ValidationError::new("dispatcher.max_pending_tasks", "must be > 0"));
    }

    if !matches!(config.observability.log_format.as_str(), "pretty" | "json") {
        errors.push(ValidationError::new(
            "observability.log_format",
            "expected \"pretty\" or \"json\"",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(validate_config(&FrontConfig::default()), Ok(()));
    }

    #[test]
    fn collects_every_error() {
        let mut config = FrontConfig::default();
        config.candidates.ips = vec!["1.2.3.4".into(), "not-an-ip".into()];
        config.pool.min_size = 5;
        config.pool.max_size = 1;
        config.dispatcher.idle_fraction = 1.5;
        config.tls.pinned_intermediates = vec!["sha256/too-short".into()];

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec![
                "candidates.ips",
                "tls.pinned_intermediates",
                "pool.min_size",
                "dispatcher.idle_fraction"
            ]
        );
    }

    #[test]
    fn empty_pool_is_allowed() {
        let mut config = FrontConfig::default();
        config.pool.min_size = 0;
        config.pool.max_size = 0;
        config.pool.max_connect_attempts = 0;
        assert!(validate_config(&config).is_ok());
    }
}
