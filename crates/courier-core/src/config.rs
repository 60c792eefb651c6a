//! Courier configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CourierError, Result};
use crate::types::{Lane, UnhandledAction, UnresolvedReason};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CourierConfig {
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub lanes: LaneConfig,
}

impl CourierConfig {
    /// Load config from the default path (~/.courier/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CourierError::Config(format!("Failed to read config: {e}")))?;
        Self::parse(&content)
    }

    /// Parse config from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| CourierError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| CourierError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".courier")
            .join("config.toml")
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.dispatcher.transit_count_max == 0 {
            return Err(CourierError::Config(
                "dispatcher.transit_count_max must be at least 1".into(),
            ));
        }
        if self.scheduler.poll_interval_ms == 0 {
            return Err(CourierError::Config(
                "scheduler.poll_interval_ms must be at least 1".into(),
            ));
        }
        if self.scheduler.default_priority == Lane::Internal {
            return Err(CourierError::Config(
                "scheduler.default_priority cannot use the reserved internal lane".into(),
            ));
        }
        for lane in Lane::ALL {
            if self.lanes.max_concurrent(lane) == 0 {
                return Err(CourierError::Config(format!(
                    "lanes.{lane} must allow at least one concurrent task"
                )));
            }
        }
        Ok(())
    }
}

/// Dispatcher routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// How many dispatcher passes a message may make before it is treated as a loop.
    #[serde(default = "default_transit_count_max")]
    pub transit_count_max: u32,
    /// Record per-envelope trace logs.
    #[serde(default)]
    pub trace_enabled: bool,
    /// Processing-time hint stamped on envelopes created by the dispatcher.
    #[serde(default)]
    pub max_processing_ms: Option<u64>,
    #[serde(default)]
    pub unhandled: UnhandledPolicy,
}

fn default_transit_count_max() -> u32 { 20 }

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            transit_count_max: default_transit_count_max(),
            trace_enabled: false,
            max_processing_ms: None,
            unhandled: UnhandledPolicy::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn max_processing_time(&self) -> Option<Duration> {
        self.max_processing_ms.map(Duration::from_millis)
    }
}

/// Unhandled-payload policy, one action per trigger reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnhandledPolicy {
    #[serde(default = "default_unhandled_action")]
    pub handler_not_found: UnhandledAction,
    #[serde(default = "default_unhandled_action")]
    pub no_outbound_channel: UnhandledAction,
}

fn default_unhandled_action() -> UnhandledAction { UnhandledAction::AttemptResponseFailMessage }

impl Default for UnhandledPolicy {
    fn default() -> Self {
        Self {
            handler_not_found: default_unhandled_action(),
            no_outbound_channel: default_unhandled_action(),
        }
    }
}

impl UnhandledPolicy {
    pub fn action_for(&self, reason: UnresolvedReason) -> UnhandledAction {
        match reason {
            UnresolvedReason::HandlerNotFound => self.handler_not_found,
            UnresolvedReason::NoOutboundChannel => self.no_outbound_channel,
        }
    }
}

/// Polling scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Lane for user schedules without their own priority.
    #[serde(default)]
    pub default_priority: Lane,
}

fn default_poll_interval_ms() -> u64 { 100 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            default_priority: Lane::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Max concurrent units of work per lane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneConfig {
    #[serde(default = "default_internal_slots")]
    pub internal: usize,
    #[serde(default = "default_high_slots")]
    pub high: usize,
    #[serde(default = "default_normal_slots")]
    pub normal: usize,
    #[serde(default = "default_low_slots")]
    pub low: usize,
}

fn default_internal_slots() -> usize { 2 }
fn default_high_slots() -> usize { 4 }
fn default_normal_slots() -> usize { 4 }
fn default_low_slots() -> usize { 2 }

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            internal: default_internal_slots(),
            high: default_high_slots(),
            normal: default_normal_slots(),
            low: default_low_slots(),
        }
    }
}

impl LaneConfig {
    pub fn max_concurrent(&self, lane: Lane) -> usize {
        match lane {
            Lane::Internal => self.internal,
            Lane::High => self.high,
            Lane::Normal => self.normal,
            Lane::Low => self.low,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CourierConfig::default();
        assert_eq!(config.dispatcher.transit_count_max, 20);
        assert_eq!(config.scheduler.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.scheduler.default_priority, Lane::Normal);
        assert_eq!(config.lanes.max_concurrent(Lane::High), 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = CourierConfig::parse(
            r#"
            [dispatcher]
            transit_count_max = 5

            [dispatcher.unhandled]
            handler_not_found = "ignore"

            [scheduler]
            default_priority = "low"
            "#,
        )
        .unwrap();
        assert_eq!(config.dispatcher.transit_count_max, 5);
        assert_eq!(
            config.dispatcher.unhandled.action_for(UnresolvedReason::HandlerNotFound),
            UnhandledAction::Ignore
        );
        assert_eq!(
            config.dispatcher.unhandled.action_for(UnresolvedReason::NoOutboundChannel),
            UnhandledAction::AttemptResponseFailMessage
        );
        assert_eq!(config.scheduler.default_priority, Lane::Low);
        assert_eq!(config.scheduler.poll_interval_ms, 100);
    }

    #[test]
    fn test_rejects_internal_default_priority() {
        let result = CourierConfig::parse("[scheduler]\ndefault_priority = \"internal\"\n");
        assert!(matches!(result, Err(CourierError::Config(_))));
    }

    #[test]
    fn test_rejects_zero_transit_max() {
        let result = CourierConfig::parse("[dispatcher]\ntransit_count_max = 0\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = std::env::temp_dir().join("courier-test-config");
        let path = dir.join("config.toml");
        let mut config = CourierConfig::default();
        config.lanes.low = 7;
        config.save_to(&path).unwrap();

        let loaded = CourierConfig::load_from(&path).unwrap();
        assert_eq!(loaded.lanes.low, 7);
        std::fs::remove_dir_all(&dir).ok();
    }
}
