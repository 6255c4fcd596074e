//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Logical scheduling priority for the encoder process.
///
/// Ordered from most deprioritized (`Idle`) to least (`AboveNormal`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PriorityLevel {
    Idle,
    BelowNormal,
    Normal,
    AboveNormal,
}

impl PriorityLevel {
    /// All levels in ascending order.
    pub const ALL: [PriorityLevel; 4] = [
        PriorityLevel::Idle,
        PriorityLevel::BelowNormal,
        PriorityLevel::Normal,
        PriorityLevel::AboveNormal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityLevel::Idle => "idle",
            PriorityLevel::BelowNormal => "belownormal",
            PriorityLevel::Normal => "normal",
            PriorityLevel::AboveNormal => "abovenormal",
        }
    }
}

impl Default for PriorityLevel {
    fn default() -> Self {
        Self::Idle
    }
}

impl fmt::Display for PriorityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a priority or mode string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
    pub expected: &'static str,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid {} '{}' (expected one of: {})",
            self.kind, self.value, self.expected
        )
    }
}

impl std::error::Error for UnknownVariant {}

impl FromStr for PriorityLevel {
    type Err = UnknownVariant;

    /// Case-insensitive, so `BelowNormal` and `belownormal` are equivalent.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "idle" => Ok(PriorityLevel::Idle),
            "belownormal" => Ok(PriorityLevel::BelowNormal),
            "normal" => Ok(PriorityLevel::Normal),
            "abovenormal" => Ok(PriorityLevel::AboveNormal),
            _ => Err(UnknownVariant {
                kind: "priority",
                value: s.to_string(),
                expected: "idle, belownormal, normal, abovenormal",
            }),
        }
    }
}

impl TryFrom<String> for PriorityLevel {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PriorityLevel> for String {
    fn from(level: PriorityLevel) -> Self {
        level.as_str().to_string()
    }
}

/// How an item's input is handed to the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ProcessingMode {
    /// Copy the source into the scratch area and publish on success.
    Staged,
    /// Rename the source in place and encode straight to the final path.
    Direct,
}

impl ProcessingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingMode::Staged => "staged",
            ProcessingMode::Direct => "direct",
        }
    }
}

impl Default for ProcessingMode {
    fn default() -> Self {
        Self::Staged
    }
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingMode {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "staged" | "temp" => Ok(ProcessingMode::Staged),
            "direct" | "quick" => Ok(ProcessingMode::Direct),
            _ => Err(UnknownVariant {
                kind: "processing mode",
                value: s.to_string(),
                expected: "staged, direct",
            }),
        }
    }
}

impl TryFrom<String> for ProcessingMode {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProcessingMode> for String {
    fn from(mode: ProcessingMode) -> Self {
        mode.as_str().to_string()
    }
}

/// Encoder selection and per-attempt limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Directory holding the ffmpeg binary (falls back to PATH lookup)
    #[serde(default)]
    pub ffmpeg_dir: Option<PathBuf>,
    /// Encoder tried first (usually a hardware encoder)
    #[serde(default = "default_primary")]
    pub primary: String,
    /// Extra ffmpeg options for the primary encoder, whitespace separated
    #[serde(default = "default_primary_options")]
    pub primary_options: String,
    /// Encoder tried after a non-timeout primary failure (empty disables)
    #[serde(default = "default_fallback")]
    pub fallback: String,
    /// Extra ffmpeg options for the fallback encoder
    #[serde(default = "default_fallback_options")]
    pub fallback_options: String,
    /// Deadline per attempt in seconds (0 = unbounded)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_primary() -> String {
    "av1_nvenc".to_string()
}

fn default_primary_options() -> String {
    "-cq 25 -preset p5".to_string()
}

fn default_fallback() -> String {
    "libsvtav1".to_string()
}

fn default_fallback_options() -> String {
    "-crf 28 -preset 7".to_string()
}

fn default_timeout_secs() -> u64 {
    7200
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_dir: None,
            primary: default_primary(),
            primary_options: default_primary_options(),
            fallback: default_fallback(),
            fallback_options: default_fallback_options(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Encoder process scheduling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessConfig {
    #[serde(default)]
    pub priority: PriorityLevel,
    /// Delay before applying priority to an already-started process
    #[serde(default = "default_priority_delay_ms")]
    pub priority_delay_ms: u64,
}

fn default_priority_delay_ms() -> u64 {
    150
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            priority: PriorityLevel::default(),
            priority_delay_ms: default_priority_delay_ms(),
        }
    }
}

/// Per-item processing behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingConfig {
    #[serde(default)]
    pub mode: ProcessingMode,
    /// Appended to the source stem to form the output file name
    #[serde(default = "default_output_suffix")]
    pub output_suffix: String,
}

fn default_output_suffix() -> String {
    "_AV1.mp4".to_string()
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            mode: ProcessingMode::default(),
            output_suffix: default_output_suffix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct LoggingConfig {
    /// Verbose logging, also raises ffmpeg's log level
    #[serde(default)]
    pub debug: bool,
    /// Mirror log output into a file in the destination directory
    #[serde(default)]
    pub log_to_file: bool,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - TRANSAV1_FFMPEG_DIR -> encoder.ffmpeg_dir
    /// - TRANSAV1_PRIMARY_ENCODER -> encoder.primary
    /// - TRANSAV1_PRIMARY_OPTIONS -> encoder.primary_options
    /// - TRANSAV1_FALLBACK_ENCODER -> encoder.fallback
    /// - TRANSAV1_FALLBACK_OPTIONS -> encoder.fallback_options
    /// - TRANSAV1_TIMEOUT_SECS -> encoder.timeout_secs
    /// - TRANSAV1_PRIORITY -> process.priority
    /// - TRANSAV1_MODE -> processing.mode
    /// - TRANSAV1_DEBUG -> logging.debug
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("TRANSAV1_FFMPEG_DIR") {
            if !val.is_empty() {
                self.encoder.ffmpeg_dir = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = env::var("TRANSAV1_PRIMARY_ENCODER") {
            self.encoder.primary = val;
        }

        if let Ok(val) = env::var("TRANSAV1_PRIMARY_OPTIONS") {
            self.encoder.primary_options = val;
        }

        // An empty value is meaningful here: it disables the fallback
        if let Ok(val) = env::var("TRANSAV1_FALLBACK_ENCODER") {
            self.encoder.fallback = val;
        }

        if let Ok(val) = env::var("TRANSAV1_FALLBACK_OPTIONS") {
            self.encoder.fallback_options = val;
        }

        if let Ok(val) = env::var("TRANSAV1_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.encoder.timeout_secs = secs;
            }
        }

        if let Ok(val) = env::var("TRANSAV1_PRIORITY") {
            if let Ok(level) = val.parse::<PriorityLevel>() {
                self.process.priority = level;
            }
        }

        if let Ok(val) = env::var("TRANSAV1_MODE") {
            if let Ok(mode) = val.parse::<ProcessingMode>() {
                self.processing.mode = mode;
            }
        }

        if let Ok(val) = env::var("TRANSAV1_DEBUG") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.logging.debug = true,
                "false" | "0" | "no" => self.logging.debug = false,
                _ => {} // Invalid value, keep existing
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults plus environment overrides, for runs without a config file
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Per-attempt encoder deadline; `None` when the timeout is disabled
    pub fn encode_timeout(&self) -> Option<Duration> {
        match self.encoder.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn priority_delay(&self) -> Duration {
        Duration::from_millis(self.process.priority_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        for key in [
            "TRANSAV1_FFMPEG_DIR",
            "TRANSAV1_PRIMARY_ENCODER",
            "TRANSAV1_PRIMARY_OPTIONS",
            "TRANSAV1_FALLBACK_ENCODER",
            "TRANSAV1_FALLBACK_OPTIONS",
            "TRANSAV1_TIMEOUT_SECS",
            "TRANSAV1_PRIORITY",
            "TRANSAV1_MODE",
            "TRANSAV1_DEBUG",
        ] {
            env::remove_var(key);
        }
    }

    fn priority_strategy() -> impl Strategy<Value = PriorityLevel> {
        prop::sample::select(PriorityLevel::ALL.to_vec())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            primary in "[a-z0-9_]{1,16}",
            fallback in "[a-z0-9_]{0,16}",
            timeout_secs in 0u64..100_000,
            priority in priority_strategy(),
            direct in proptest::bool::ANY,
            debug in proptest::bool::ANY,
        ) {
            let mode = if direct { "direct" } else { "staged" };
            let toml_str = format!(
                r#"
[encoder]
primary = "{}"
fallback = "{}"
timeout_secs = {}

[process]
priority = "{}"

[processing]
mode = "{}"

[logging]
debug = {}
"#,
                primary, fallback, timeout_secs, priority, mode, debug
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(&config.encoder.primary, &primary);
            prop_assert_eq!(&config.encoder.fallback, &fallback);
            prop_assert_eq!(config.encoder.timeout_secs, timeout_secs);
            prop_assert_eq!(config.process.priority, priority);
            prop_assert_eq!(config.processing.mode == ProcessingMode::Direct, direct);
            prop_assert_eq!(config.logging.debug, debug);
        }

        #[test]
        fn prop_priority_parse_ignores_case(level in priority_strategy(), upper in proptest::bool::ANY) {
            let text = if upper { level.as_str().to_uppercase() } else { level.as_str().to_string() };
            prop_assert_eq!(text.parse::<PriorityLevel>().unwrap(), level);
        }

        #[test]
        fn prop_env_overrides_timeout(initial in 0u64..10_000, override_secs in 0u64..10_000) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[encoder]\ntimeout_secs = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("TRANSAV1_TIMEOUT_SECS", override_secs.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.encoder.timeout_secs, override_secs);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.encoder.primary, "av1_nvenc");
        assert_eq!(config.encoder.primary_options, "-cq 25 -preset p5");
        assert_eq!(config.encoder.fallback, "libsvtav1");
        assert_eq!(config.encoder.fallback_options, "-crf 28 -preset 7");
        assert_eq!(config.encoder.timeout_secs, 7200);
        assert_eq!(config.process.priority, PriorityLevel::Idle);
        assert_eq!(config.process.priority_delay_ms, 150);
        assert_eq!(config.processing.mode, ProcessingMode::Staged);
        assert_eq!(config.processing.output_suffix, "_AV1.mp4");
        assert!(!config.logging.debug);
        assert!(!config.logging.log_to_file);
    }

    #[test]
    fn test_priority_accepts_mixed_case_in_toml() {
        let config = Config::parse_toml("[process]\npriority = \"BelowNormal\"\n").unwrap();
        assert_eq!(config.process.priority, PriorityLevel::BelowNormal);
    }

    #[test]
    fn test_unknown_priority_is_rejected() {
        let result = Config::parse_toml("[process]\npriority = \"realtime\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_quick_is_an_alias_for_direct() {
        assert_eq!("quick".parse::<ProcessingMode>().unwrap(), ProcessingMode::Direct);
        assert_eq!("Staged".parse::<ProcessingMode>().unwrap(), ProcessingMode::Staged);
    }

    #[test]
    fn test_priority_levels_are_ordered() {
        assert!(PriorityLevel::Idle < PriorityLevel::BelowNormal);
        assert!(PriorityLevel::BelowNormal < PriorityLevel::Normal);
        assert!(PriorityLevel::Normal < PriorityLevel::AboveNormal);
    }

    #[test]
    fn test_zero_timeout_means_unbounded() {
        let mut config = Config::default();
        config.encoder.timeout_secs = 0;
        assert_eq!(config.encode_timeout(), None);

        config.encoder.timeout_secs = 30;
        assert_eq!(config.encode_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_env_can_disable_fallback() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("TRANSAV1_FALLBACK_ENCODER", "");
        env::set_var("TRANSAV1_PRIORITY", "AboveNormal");
        env::set_var("TRANSAV1_MODE", "direct");
        env::set_var("TRANSAV1_DEBUG", "yes");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.encoder.fallback, "");
        assert_eq!(config.process.priority, PriorityLevel::AboveNormal);
        assert_eq!(config.processing.mode, ProcessingMode::Direct);
        assert!(config.logging.debug);
    }

    #[test]
    fn test_invalid_env_values_keep_existing() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("TRANSAV1_TIMEOUT_SECS", "soon");
        env::set_var("TRANSAV1_PRIORITY", "realtime");
        env::set_var("TRANSAV1_DEBUG", "maybe");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.encoder.timeout_secs, 7200);
        assert_eq!(config.process.priority, PriorityLevel::Idle);
        assert!(!config.logging.debug);
    }
}
