//! Settings consumed by the reply guard.
//!
//! [`RetrySettings`] are owned by the host and re-read on every decision, so
//! they deserialize leniently: hosts often hand over loosely typed values
//! (numeric strings, negative or non-finite numbers) and a bad value must
//! degrade to a floor of zero instead of failing. [`GuardConfig`] is the
//! static, file-backed part of the configuration.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde_json::Value;

use crate::error::ReplyGuardError;
use crate::error::Result;

pub const DEFAULT_PRIMARY_TAG: &str = "content";
pub const DEFAULT_ALTERNATE_TAG: &str = "reply";
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_COOLDOWN_MS: u64 = 3_000;
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 300;

/// Retry policy as configured by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    #[serde(deserialize_with = "lenient_flag")]
    pub enabled: bool,
    #[serde(alias = "maxRetries", deserialize_with = "lenient_count_u32")]
    pub max_retries: u32,
    #[serde(alias = "cooldownMs", deserialize_with = "lenient_count_u64")]
    pub cooldown_ms: u64,
    #[serde(alias = "stopOnManualRegen", deserialize_with = "lenient_flag")]
    pub stop_on_manual_regen: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: DEFAULT_MAX_RETRIES,
            cooldown_ms: DEFAULT_COOLDOWN_MS,
            stop_on_manual_regen: true,
        }
    }
}

impl RetrySettings {
    /// Reads settings from raw host JSON. Missing fields take defaults and
    /// malformed numbers are clamped to zero.
    pub fn from_json(value: &Value) -> Self {
        match Self::deserialize(value) {
            Ok(settings) => settings,
            Err(err) => {
                tracing::warn!(target: "reply_guard::config", "unreadable retry settings, using defaults: {err}");
                Self::default()
            }
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Settings of the cooperating automation whose sends are gated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CooperatingSettings {
    pub enabled: bool,
    #[serde(alias = "autoContinueActive")]
    pub auto_continue_active: bool,
    #[serde(alias = "selectedOption")]
    pub selected_option: Option<String>,
    #[serde(alias = "optionList")]
    pub option_list: Vec<String>,
}

impl CooperatingSettings {
    pub fn from_json(value: &Value) -> Option<Self> {
        match Self::deserialize(value) {
            Ok(settings) => Some(settings),
            Err(err) => {
                tracing::debug!(target: "reply_guard::config", "ignoring cooperating settings: {err}");
                None
            }
        }
    }

    /// True when the automation is armed to send continue-style messages.
    pub fn is_auto_continue_armed(&self) -> bool {
        self.enabled && self.auto_continue_active
    }

    /// Compares trimmed text against the trimmed selected option and option
    /// list. Blank options and blank messages never match.
    pub fn matches_option(&self, message_text: &str) -> bool {
        let message = message_text.trim();
        if message.is_empty() {
            return false;
        }
        self.selected_option
            .iter()
            .chain(self.option_list.iter())
            .map(|option| option.trim())
            .any(|option| !option.is_empty() && option == message)
    }
}

/// Names of the tags whose content makes a reply acceptable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplyTags {
    pub primary: String,
    pub alternate: String,
}

impl Default for ReplyTags {
    fn default() -> Self {
        Self {
            primary: DEFAULT_PRIMARY_TAG.to_string(),
            alternate: DEFAULT_ALTERNATE_TAG.to_string(),
        }
    }
}

/// Static configuration, typically loaded once from `reply_guard.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Initial retry settings for hosts that do not manage their own.
    pub retry: RetrySettings,
    pub tags: ReplyTags,
    #[serde(deserialize_with = "lenient_count_u64")]
    pub settle_delay_ms: u64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            retry: RetrySettings::default(),
            tags: ReplyTags::default(),
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
        }
    }
}

impl GuardConfig {
    pub fn from_toml_str(raw: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ReplyGuardError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw).map_err(|source| ReplyGuardError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Coerces a loosely typed value to a non-negative whole number. Numbers and
/// numeric strings are floored; negative, non-finite and non-numeric values
/// become zero.
pub fn coerce_count(value: &Value) -> u64 {
    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    match number {
        Some(n) if n.is_finite() && n > 0.0 => {
            if n >= u64::MAX as f64 {
                u64::MAX
            } else {
                n.floor() as u64
            }
        }
        _ => 0,
    }
}

fn coerce_flag(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0 && n.is_finite()),
        Value::String(text) => matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes" | "on"
        ),
        _ => false,
    }
}

fn lenient_count_u64<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(coerce_count(&value))
}

fn lenient_count_u32<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(u32::try_from(coerce_count(&value)).unwrap_or(u32::MAX))
}

fn lenient_flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(coerce_flag(&value))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_defaults() {
        let settings = RetrySettings::default();
        assert!(settings.enabled);
        assert_eq!(settings.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(
            settings.cooldown(),
            Duration::from_millis(DEFAULT_COOLDOWN_MS)
        );
        assert!(settings.stop_on_manual_regen);
    }

    #[test]
    fn test_from_json_accepts_camel_case_host_fields() {
        let settings = RetrySettings::from_json(&json!({
            "enabled": false,
            "maxRetries": 5,
            "cooldownMs": 1500,
            "stopOnManualRegen": false,
        }));
        assert_eq!(
            settings,
            RetrySettings {
                enabled: false,
                max_retries: 5,
                cooldown_ms: 1500,
                stop_on_manual_regen: false,
            }
        );
    }

    #[test]
    fn test_malformed_numbers_clamp_to_zero() {
        let settings = RetrySettings::from_json(&json!({
            "max_retries": -4,
            "cooldown_ms": "not a number",
        }));
        assert_eq!(settings.max_retries, 0);
        assert_eq!(settings.cooldown_ms, 0);

        let settings = RetrySettings::from_json(&json!({
            "max_retries": null,
            "cooldown_ms": [1, 2],
        }));
        assert_eq!(settings.max_retries, 0);
        assert_eq!(settings.cooldown_ms, 0);
    }

    #[test]
    fn test_fractional_and_string_numbers_are_floored() {
        let settings = RetrySettings::from_json(&json!({
            "max_retries": 2.9,
            "cooldown_ms": " 1250.7 ",
        }));
        assert_eq!(settings.max_retries, 2);
        assert_eq!(settings.cooldown_ms, 1250);
    }

    #[test]
    fn test_coerce_count_edge_cases() {
        assert_eq!(coerce_count(&json!(0)), 0);
        assert_eq!(coerce_count(&json!(-0.5)), 0);
        assert_eq!(coerce_count(&json!("NaN")), 0);
        assert_eq!(coerce_count(&json!("inf")), 0);
        assert_eq!(coerce_count(&json!(true)), 0);
        assert_eq!(coerce_count(&json!(7)), 7);
        assert_eq!(coerce_count(&json!(1e300)), u64::MAX);
    }

    #[test]
    fn test_non_object_settings_fall_back_to_defaults() {
        assert_eq!(
            RetrySettings::from_json(&json!("garbage")),
            RetrySettings::default()
        );
    }

    #[test]
    fn test_cooperating_option_matching_trims_both_sides() {
        let settings = CooperatingSettings {
            enabled: true,
            auto_continue_active: true,
            selected_option: Some("  Skip ahead ".to_string()),
            option_list: vec!["Later that day".to_string(), "   ".to_string()],
        };
        assert!(settings.is_auto_continue_armed());
        assert!(settings.matches_option("Skip ahead"));
        assert!(settings.matches_option("\nLater that day  "));
        assert!(!settings.matches_option("Skip"));
        assert!(!settings.matches_option("   "));
    }

    #[test]
    fn test_blank_message_never_matches() {
        let settings = CooperatingSettings {
            enabled: true,
            auto_continue_active: true,
            selected_option: Some(String::new()),
            option_list: vec!["  ".to_string()],
        };
        assert!(!settings.matches_option(""));
        assert!(!settings.matches_option("  "));
        assert!(!settings.matches_option("\n\t"));

        let settings = CooperatingSettings {
            selected_option: None,
            option_list: Vec::new(),
            ..settings
        };
        assert!(!settings.matches_option(""));
    }

    #[test]
    fn test_cooperating_settings_from_host_json() {
        let settings = CooperatingSettings::from_json(&json!({
            "enabled": true,
            "autoContinueActive": true,
            "selectedOption": "Next morning",
            "optionList": ["Next morning", "An hour later"],
        }));
        let Some(settings) = settings else {
            panic!("expected cooperating settings to parse");
        };
        assert!(settings.is_auto_continue_armed());
        assert_eq!(settings.option_list.len(), 2);
    }

    #[test]
    fn test_guard_config_from_toml() {
        let raw = r#"
settle_delay_ms = 500

[retry]
enabled = true
max_retries = 2
cooldown_ms = 1000
stop_on_manual_regen = false

[tags]
primary = "story"
alternate = "summary"
"#;
        let Ok(config) = GuardConfig::from_toml_str(raw) else {
            panic!("expected config to parse");
        };
        assert_eq!(config.settle_delay(), Duration::from_millis(500));
        assert_eq!(config.retry.max_retries, 2);
        assert!(!config.retry.stop_on_manual_regen);
        assert_eq!(config.tags.primary, "story");
    }

    #[test]
    fn test_guard_config_toml_negative_values_clamp() {
        let raw = r#"
settle_delay_ms = -20

[retry]
max_retries = -1
cooldown_ms = nan
"#;
        let Ok(config) = GuardConfig::from_toml_str(raw) else {
            panic!("expected config to parse");
        };
        assert_eq!(config.settle_delay_ms, 0);
        assert_eq!(config.retry.max_retries, 0);
        assert_eq!(config.retry.cooldown_ms, 0);
        assert_eq!(config.tags, ReplyTags::default());
    }

    #[test]
    fn test_load_reports_missing_file() {
        let Ok(dir) = tempfile::TempDir::new() else {
            panic!("tempdir");
        };
        let missing = dir.path().join("absent.toml");
        assert!(matches!(
            GuardConfig::load(&missing),
            Err(ReplyGuardError::ConfigRead { .. })
        ));
    }

    #[test]
    fn test_load_reads_file() {
        let Ok(dir) = tempfile::TempDir::new() else {
            panic!("tempdir");
        };
        let path = dir.path().join("reply_guard.toml");
        if let Err(err) = std::fs::write(&path, "[retry]\nmax_retries = 4\n") {
            panic!("write config: {err}");
        }
        match GuardConfig::load(&path) {
            Ok(config) => {
                assert_eq!(config.retry.max_retries, 4);
                assert_eq!(config.settle_delay_ms, DEFAULT_SETTLE_DELAY_MS);
            }
            Err(err) => panic!("load failed: {err}"),
        }
    }
}
