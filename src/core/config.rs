//! Configuration management with layered hierarchy
//!
//! Layers, lowest priority first:
//! 1. built-in defaults (`defaults/config.yaml`, compiled in)
//! 2. global user config (`<config dir>/caliber/config.yaml`)
//! 3. an explicit `--config` file
//! 4. environment variables (`CALIBER_CONFIG_NAME`, `CALIBER_DB`)
//!
//! File layers are merged key-by-key before being read into typed structs,
//! and every typed struct fills missing fields from its documented default.
//! Unknown keys are rejected so a misspelled limit never goes unnoticed.

use miette::Diagnostic;
use rust_embed::Embed;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::measurement::DEFAULT_LOADING_READINGS;

/// Newest configuration file version this build understands
pub const SUPPORTED_CONFIG_VERSION: u32 = 1;

/// Config name used when none is selected
pub const DEFAULT_CONFIG_NAME: &str = "hydraulic_torque_wrench_standard";

#[derive(Embed)]
#[folder = "defaults/"]
struct DefaultConfig;

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    #[diagnostic(code(caliber::config::io))]
    Io { path: PathBuf, message: String },

    #[error("Invalid configuration in {origin}: {message}")]
    #[diagnostic(
        code(caliber::config::parse),
        help("check key names against `caliber config show`")
    )]
    Parse { origin: String, message: String },

    #[error("Config {origin} has version {found}, newest supported is {supported}")]
    #[diagnostic(code(caliber::config::version))]
    UnsupportedVersion {
        origin: String,
        found: u32,
        supported: u32,
    },

    #[error("Engine config '{config}': {message}")]
    #[diagnostic(code(caliber::config::invalid))]
    Invalid { config: String, message: String },

    #[error("Built-in configuration is missing")]
    #[diagnostic(code(caliber::config::builtin))]
    MissingDefaults,
}

/// Repeatability limit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RepeatabilityMethod {
    /// Largest allowed |deviation| of the corrected mean, in percent
    pub max_deviation_percent: f64,
}

impl Default for RepeatabilityMethod {
    fn default() -> Self {
        Self {
            max_deviation_percent: 4.0,
        }
    }
}

/// Limit for a max-minus-min geometric or sequence effect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EffectMethod {
    pub max_error_nm: f64,
}

impl Default for EffectMethod {
    fn default() -> Self {
        Self { max_error_nm: 1.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoadingPointMethod {
    pub max_error_nm: f64,
    /// Readings taken at each offset; both offsets must match
    pub readings_per_position: usize,
}

impl Default for LoadingPointMethod {
    fn default() -> Self {
        Self {
            max_error_nm: 2.0,
            readings_per_position: DEFAULT_LOADING_READINGS,
        }
    }
}

/// Stage 1 limits
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Stage1Methods {
    pub repeatability: RepeatabilityMethod,
    pub reproducibility: EffectMethod,
    pub output_drive: EffectMethod,
    pub interface: EffectMethod,
    pub loading_point: LoadingPointMethod,
}

/// Stage 2 options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Stage2Methods {
    /// Compute the Type A repeatability variation; when off it is reported as 0
    pub type_a_analysis: bool,
}

impl Default for Stage2Methods {
    fn default() -> Self {
        Self {
            type_a_analysis: true,
        }
    }
}

/// Stage 3 procedure constants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Stage3Methods {
    /// Pressure gauge certificate uncertainty, percent
    pub certificate_uncertainty_percent: f64,
    /// Wrench maximum torque, Nm
    pub max_torque_nm: f64,
    /// Wrench maximum pressure, bar
    pub max_pressure_bar: f64,
    /// Input pressure gauge resolution
    pub pressure_resolution: f64,
    /// Device under test resolution
    pub device_resolution: f64,
    /// Reported confidence level for k = 2
    pub confidence_level: f64,
    /// Expanded uncertainty considered typical for the lab, percent
    pub typical_limit_percent: f64,
}

impl Default for Stage3Methods {
    fn default() -> Self {
        Self {
            certificate_uncertainty_percent: 0.390,
            max_torque_nm: 7190.0,
            max_pressure_bar: 690.0,
            pressure_resolution: 0.10,
            device_resolution: 0.10,
            confidence_level: 95.0,
            typical_limit_percent: 3.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvironmentalLimits {
    pub temperature_min: f64,
    pub temperature_max: f64,
    /// Relative humidity band, percent
    pub humidity_min: f64,
    pub humidity_max: f64,
}

impl Default for EnvironmentalLimits {
    fn default() -> Self {
        Self {
            temperature_min: 20.0,
            temperature_max: 30.0,
            humidity_min: 45.0,
            humidity_max: 75.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UncertaintyLimits {
    pub max_expanded_percent: f64,
    pub max_combined_percent: f64,
}

impl Default for UncertaintyLimits {
    fn default() -> Self {
        Self {
            max_expanded_percent: 5.0,
            max_combined_percent: 3.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MeasurementErrorLimits {
    pub max_relative_error_percent: f64,
}

impl Default for MeasurementErrorLimits {
    fn default() -> Self {
        Self {
            max_relative_error_percent: 20.0,
        }
    }
}

/// Global tolerance limits for the tolerance engine
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToleranceConfig {
    pub environmental: EnvironmentalLimits,
    pub uncertainty: UncertaintyLimits,
    pub measurement_error: MeasurementErrorLimits,
}

/// Versioned calculation procedure for one equipment type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Procedure revision, recorded on every run
    pub version: u32,
    pub config_name: String,
    pub stage1_methods: Stage1Methods,
    pub stage2_methods: Stage2Methods,
    pub stage3_methods: Stage3Methods,
    pub tolerance_config: ToleranceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: 1,
            config_name: DEFAULT_CONFIG_NAME.to_string(),
            stage1_methods: Stage1Methods::default(),
            stage2_methods: Stage2Methods::default(),
            stage3_methods: Stage3Methods::default(),
            tolerance_config: ToleranceConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Reject settings no calculation could run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stage1_methods.loading_point.readings_per_position < 1 {
            return Err(ConfigError::Invalid {
                config: self.config_name.clone(),
                message: "loading_point.readings_per_position must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Apply a job's tolerance override on top of this config
    pub fn with_override(mut self, limits: &ToleranceOverride) -> Self {
        let s1 = &mut self.stage1_methods;
        if let Some(v) = limits.max_deviation_percent {
            s1.repeatability.max_deviation_percent = v;
        }
        if let Some(v) = limits.reproducibility_max_nm {
            s1.reproducibility.max_error_nm = v;
        }
        if let Some(v) = limits.output_drive_max_nm {
            s1.output_drive.max_error_nm = v;
        }
        if let Some(v) = limits.interface_max_nm {
            s1.interface.max_error_nm = v;
        }
        if let Some(v) = limits.loading_point_max_nm {
            s1.loading_point.max_error_nm = v;
        }
        if let Some(v) = limits.max_expanded_uncertainty_percent {
            self.tolerance_config.uncertainty.max_expanded_percent = v;
        }
        if let Some(v) = limits.max_combined_uncertainty_percent {
            self.tolerance_config.uncertainty.max_combined_percent = v;
        }
        if let Some(v) = limits.max_relative_error_percent {
            self.tolerance_config.measurement_error.max_relative_error_percent = v;
        }
        self
    }
}

/// Per-job tolerance-limit override; unset fields keep the procedure limit
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToleranceOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_deviation_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reproducibility_max_nm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_drive_max_nm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface_max_nm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loading_point_max_nm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_expanded_uncertainty_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_combined_uncertainty_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_relative_error_percent: Option<f64>,
}

impl ToleranceOverride {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Application settings assembled from all layers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// File format version
    pub version: u32,
    /// Engine config selected when a run does not name one
    pub config_name: String,
    /// SQLite database path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<PathBuf>,
    /// Directory of CSV lookup tables overriding the built-in ones
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tables_dir: Option<PathBuf>,
    /// Engine configs keyed by name; each is merged over the defaults
    #[serde(default)]
    pub engines: BTreeMap<String, serde_yml::Value>,
}

impl Settings {
    /// Load settings from every layer
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut merged = Self::builtin_layer()?;

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                let layer = Self::read_layer(&global_path)?;
                merge_yaml(&mut merged, layer);
                tracing::debug!(path = %global_path.display(), "merged global config");
            }
        }

        if let Some(path) = explicit {
            let layer = Self::read_layer(path)?;
            merge_yaml(&mut merged, layer);
            tracing::debug!(path = %path.display(), "merged explicit config");
        }

        let mut settings: Settings =
            serde_yml::from_value(merged).map_err(|e| ConfigError::Parse {
                origin: "merged configuration".to_string(),
                message: e.to_string(),
            })?;

        if let Ok(name) = std::env::var("CALIBER_CONFIG_NAME") {
            if !name.trim().is_empty() {
                settings.config_name = name;
            }
        }
        if let Ok(db) = std::env::var("CALIBER_DB") {
            if !db.trim().is_empty() {
                settings.database = Some(PathBuf::from(db));
            }
        }

        // Surface a bad engine config at startup, not at the first run
        for name in settings.engines.keys() {
            settings.engine_config(Some(name))?;
        }

        Ok(settings)
    }

    /// Settings from the built-in layer only
    pub fn builtin() -> Result<Self, ConfigError> {
        serde_yml::from_value(Self::builtin_layer()?).map_err(|e| ConfigError::Parse {
            origin: "built-in defaults".to_string(),
            message: e.to_string(),
        })
    }

    /// Resolve an engine config by name, falling back to the selected one
    ///
    /// Unknown names resolve to the documented default limits.
    pub fn engine_config(&self, name: Option<&str>) -> Result<EngineConfig, ConfigError> {
        let name = name.unwrap_or(&self.config_name);
        let Some(value) = self.engines.get(name) else {
            tracing::warn!(config = name, "no engine config with this name, using default limits");
            return Ok(EngineConfig {
                config_name: name.to_string(),
                ..EngineConfig::default()
            });
        };

        let mut config: EngineConfig =
            serde_yml::from_value(value.clone()).map_err(|e| ConfigError::Parse {
                origin: format!("engine config '{}'", name),
                message: e.to_string(),
            })?;
        config.config_name = name.to_string();
        config.validate()?;
        Ok(config)
    }

    /// Database path: configured value or `caliber.db` in the data directory
    pub fn database_path(&self) -> PathBuf {
        self.database.clone().unwrap_or_else(|| {
            directories::ProjectDirs::from("", "", "caliber")
                .map(|dirs| dirs.data_dir().join("caliber.db"))
                .unwrap_or_else(|| PathBuf::from("caliber.db"))
        })
    }

    /// Path of the global user config file
    pub fn global_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "caliber")
            .map(|dirs| dirs.config_dir().join("config.yaml"))
    }

    fn builtin_layer() -> Result<serde_yml::Value, ConfigError> {
        let file = DefaultConfig::get("config.yaml").ok_or(ConfigError::MissingDefaults)?;
        let contents = String::from_utf8_lossy(&file.data);
        parse_layer("built-in defaults", &contents)
    }

    fn read_layer(path: &Path) -> Result<serde_yml::Value, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        parse_layer(&path.display().to_string(), &contents)
    }
}

/// Parse one YAML layer and reject versions newer than this build supports
fn parse_layer(origin: &str, contents: &str) -> Result<serde_yml::Value, ConfigError> {
    let value: serde_yml::Value =
        serde_yml::from_str(contents).map_err(|e| ConfigError::Parse {
            origin: origin.to_string(),
            message: e.to_string(),
        })?;

    if let Some(found) = value.get("version").and_then(|v| v.as_u64()) {
        if found > u64::from(SUPPORTED_CONFIG_VERSION) {
            return Err(ConfigError::UnsupportedVersion {
                origin: origin.to_string(),
                found: u32::try_from(found).unwrap_or(u32::MAX),
                supported: SUPPORTED_CONFIG_VERSION,
            });
        }
    }

    // An empty file parses as null and contributes nothing
    if value.is_null() {
        return Ok(serde_yml::Value::Mapping(serde_yml::Mapping::new()));
    }
    Ok(value)
}

/// Merge `overlay` into `base`; mappings merge recursively, anything else replaces
pub fn merge_yaml(base: &mut serde_yml::Value, overlay: serde_yml::Value) {
    match (base, overlay) {
        (serde_yml::Value::Mapping(base_map), serde_yml::Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_settings_load() {
        let settings = Settings::builtin().unwrap();
        assert_eq!(settings.version, SUPPORTED_CONFIG_VERSION);
        assert_eq!(settings.config_name, DEFAULT_CONFIG_NAME);
        assert!(settings.engines.contains_key(DEFAULT_CONFIG_NAME));
    }

    #[test]
    fn test_builtin_engine_config_matches_defaults() {
        let settings = Settings::builtin().unwrap();
        let config = settings.engine_config(None).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_unknown_engine_name_uses_default_limits() {
        let settings = Settings::builtin().unwrap();
        let config = settings.engine_config(Some("pneumatic_wrench")).unwrap();
        assert_eq!(config.config_name, "pneumatic_wrench");
        assert_eq!(config.stage1_methods.repeatability.max_deviation_percent, 4.0);
        assert_eq!(config.stage1_methods.loading_point.max_error_nm, 2.0);
        assert_eq!(config.tolerance_config.environmental.humidity_max, 75.0);
    }

    #[test]
    fn test_partial_engine_config_merges_with_defaults() {
        let yaml = r#"
stage1_methods:
  reproducibility:
    max_error_nm: 1.5
tolerance_config:
  uncertainty:
    max_expanded_percent: 4.0
"#;
        let config: EngineConfig = serde_yml::from_str(yaml).unwrap();
        assert_eq!(config.stage1_methods.reproducibility.max_error_nm, 1.5);
        assert_eq!(config.stage1_methods.output_drive.max_error_nm, 1.0);
        assert_eq!(config.tolerance_config.uncertainty.max_expanded_percent, 4.0);
        assert_eq!(config.tolerance_config.uncertainty.max_combined_percent, 3.0);
        assert_eq!(config.stage3_methods.max_torque_nm, 7190.0);
    }

    #[test]
    fn test_misspelled_key_is_rejected() {
        let yaml = "stage1_methods:\n  repeatability:\n    max_deviaton_percent: 3.0\n";
        assert!(serde_yml::from_str::<EngineConfig>(yaml).is_err());
    }

    #[test]
    fn test_newer_version_rejected() {
        let err = parse_layer("test.yaml", "version: 99\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnsupportedVersion { found: 99, .. }
        ));
    }

    #[test]
    fn test_explicit_layer_overrides_builtin() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("lab.yaml");
        std::fs::write(
            &path,
            r#"
version: 1
config_name: lab_a
engines:
  lab_a:
    stage1_methods:
      loading_point:
        readings_per_position: 4
  hydraulic_torque_wrench_standard:
    stage3_methods:
      max_torque_nm: 35000
"#,
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        let lab = settings.engine_config(None).unwrap();
        assert_eq!(lab.config_name, "lab_a");
        assert_eq!(lab.stage1_methods.loading_point.readings_per_position, 4);

        let hydraulic = settings
            .engine_config(Some(DEFAULT_CONFIG_NAME))
            .unwrap();
        assert_eq!(hydraulic.stage3_methods.max_torque_nm, 35000.0);
        // Sibling keys from the built-in layer survive the merge
        assert_eq!(hydraulic.stage3_methods.max_pressure_bar, 690.0);
    }

    #[test]
    fn test_zero_loading_readings_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("lab.yaml");
        std::fs::write(
            &path,
            "engines:\n  lab_a:\n    stage1_methods:\n      loading_point:\n        readings_per_position: 0\n",
        )
        .unwrap();

        let err = Settings::load(Some(&path)).unwrap_err();
        assert!(matches!(&err, ConfigError::Invalid { config, .. } if config == "lab_a"));
        assert!(err.to_string().contains("readings_per_position"));

        let mut config = EngineConfig::default();
        config.stage1_methods.loading_point.readings_per_position = 1;
        assert!(config.validate().is_ok());
        config.stage1_methods.loading_point.readings_per_position = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_merge_yaml_replaces_scalars_and_merges_maps() {
        let mut base: serde_yml::Value = serde_yml::from_str("a: 1\nb:\n  c: 2\n  d: 3\n").unwrap();
        let overlay: serde_yml::Value = serde_yml::from_str("a: 5\nb:\n  d: 4\n").unwrap();
        merge_yaml(&mut base, overlay);
        assert_eq!(base["a"].as_u64(), Some(5));
        assert_eq!(base["b"]["c"].as_u64(), Some(2));
        assert_eq!(base["b"]["d"].as_u64(), Some(4));
    }

    #[test]
    fn test_override_applies_only_set_fields() {
        let limits = ToleranceOverride {
            reproducibility_max_nm: Some(1.5),
            ..Default::default()
        };
        assert!(!limits.is_empty());
        let config = EngineConfig::default().with_override(&limits);
        assert_eq!(config.stage1_methods.reproducibility.max_error_nm, 1.5);
        assert_eq!(config.stage1_methods.interface.max_error_nm, 1.0);
        assert!(ToleranceOverride::default().is_empty());
    }
}
