//! Rule-level options.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointConfig;
use crate::errors::EngineError;
use crate::types::Qos;

/// Options shared by every node of a rule.
///
/// Deserializes from the JSON `options` object of a rule definition; every
/// field is optional and falls back to [`RuleOptions::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuleOptions {
    /// Window on the tuples' own timestamps instead of arrival time.
    pub is_event_time: bool,
    /// Allowed lateness in milliseconds, event-time only.
    pub late_tolerance: i64,
    /// Capacity of every node input channel.
    pub buffer_length: usize,
    /// Forward in-band errors to the sink consumer.
    pub send_error: bool,
    pub qos: Qos,
    /// Milliseconds between checkpoints.
    pub checkpoint_interval: u64,
    /// Milliseconds a checkpoint may stay pending before it is cancelled.
    pub checkpoint_timeout: u64,
}

impl Default for RuleOptions {
    fn default() -> Self {
        Self {
            is_event_time: false,
            late_tolerance: 0,
            buffer_length: crate::channel::DEFAULT_CHANNEL_CAPACITY,
            send_error: true,
            qos: Qos::AtMostOnce,
            checkpoint_interval: 5_000,
            checkpoint_timeout: 200_000,
        }
    }
}

impl RuleOptions {
    /// Parse and validate options from a JSON document.
    pub fn from_json(raw: &str) -> Result<Self> {
        let options: RuleOptions =
            serde_json::from_str(raw).context("Failed to parse rule options")?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.late_tolerance < 0 {
            return Err(EngineError::configuration(format!(
                "lateTolerance must be >= 0, got {}",
                self.late_tolerance
            ))
            .into());
        }
        if self.buffer_length == 0 {
            return Err(EngineError::configuration("bufferLength must be > 0").into());
        }
        if self.qos.is_checkpointed() {
            if self.checkpoint_interval == 0 {
                return Err(
                    EngineError::configuration("checkpointInterval must be > 0").into(),
                );
            }
            if self.checkpoint_timeout == 0 {
                return Err(EngineError::configuration("checkpointTimeout must be > 0").into());
            }
        }
        Ok(())
    }

    pub fn checkpoint_config(&self) -> CheckpointConfig {
        CheckpointConfig {
            interval: Duration::from_millis(self.checkpoint_interval),
            timeout: Duration::from_millis(self.checkpoint_timeout),
            ..CheckpointConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_object() {
        let options = RuleOptions::from_json("{}").unwrap();
        assert_eq!(options, RuleOptions::default());
        assert!(options.send_error);
        assert_eq!(options.buffer_length, 1024);
    }

    #[test]
    fn test_parse_camel_case_fields() {
        let options = RuleOptions::from_json(
            r#"{"isEventTime": true, "lateTolerance": 500, "qos": "exactly_once", "checkpointInterval": 1000}"#,
        )
        .unwrap();
        assert!(options.is_event_time);
        assert_eq!(options.late_tolerance, 500);
        assert_eq!(options.qos, Qos::ExactlyOnce);
        assert_eq!(
            options.checkpoint_config().interval,
            Duration::from_millis(1000)
        );
    }

    #[test]
    fn test_reject_negative_late_tolerance() {
        let err = RuleOptions::from_json(r#"{"lateTolerance": -1}"#).unwrap_err();
        assert!(err.to_string().contains("lateTolerance"));
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn test_zero_interval_only_matters_with_checkpointing() {
        let mut options = RuleOptions {
            checkpoint_interval: 0,
            ..RuleOptions::default()
        };
        assert!(options.validate().is_ok());
        options.qos = Qos::AtLeastOnce;
        assert!(options.validate().is_err());
    }
}
