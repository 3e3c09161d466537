//! Configuration loading
//!
//! Resolution order for the configuration file:
//! 1. `--config` command-line argument
//! 2. `SEGFUSION_CONFIG` environment variable
//! 3. `{config_dir}/segfusion/config.toml`
//! 4. Compiled defaults
//!
//! An explicitly named file that cannot be read is an error; a missing
//! per-user file silently falls back to the defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::enums::{CopyMode, OverrideMatch, PassId, SortBy};
use crate::error::{Error, Result};
use crate::external::CommandTemplate;
use crate::fusion::FusionOptions;
use crate::inference::{CommandInferenceEngine, PassSpec};
use crate::nifti_io::NIFTI_EXTENSIONS;
use crate::tools::{CommandConverter, CommandRegistrar};

pub const CONFIG_ENV_VAR: &str = "SEGFUSION_CONFIG";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Permanent per-case outputs land in `{output_root}/{caseID}/`
    pub output_root: PathBuf,
    /// Scratch workspaces land in `{scratch_root}/{caseID}/`
    pub scratch_root: PathBuf,
    /// `nii.gz` or `nii`
    pub extension: String,
    /// Channel layout of the permanent case directory, in index order
    pub channels: Vec<String>,
    pub copy_mode: CopyMode,
    pub tumor_label: u32,
    pub keep_base_if_override_empty: bool,
    pub override_match: OverrideMatch,
    /// Run both passes at once instead of one after the other
    pub concurrent_passes: bool,
    /// Keep the scratch workspace after a successful run
    pub keep_workspace: bool,
    /// Upper bound for any single external tool; unlimited when absent
    pub tool_timeout_secs: Option<u64>,
    pub logging: LoggingConfig,
    pub converter: ConverterConfig,
    pub registration: CommandTemplate,
    pub inference: CommandTemplate,
    pub pass_a: PassSpec,
    pub pass_b: PassSpec,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("output"),
            scratch_root: std::env::temp_dir().join("segfusion"),
            extension: "nii.gz".to_string(),
            channels: vec!["CT".to_string(), "PET".to_string()],
            copy_mode: CopyMode::default(),
            tumor_label: 6,
            keep_base_if_override_empty: false,
            override_match: OverrideMatch::default(),
            concurrent_passes: false,
            keep_workspace: false,
            tool_timeout_secs: None,
            logging: LoggingConfig::default(),
            converter: ConverterConfig::default(),
            registration: CommandRegistrar::reg_aladin(),
            inference: CommandInferenceEngine::nnunet_predict(),
            pass_a: PassSpec::default_pass_a(),
            pass_b: PassSpec::default_pass_b(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "segfusion=info".to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConverterKind {
    #[default]
    Dcm2niix,
    Builtin,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    pub kind: ConverterKind,
    /// Command for [`ConverterKind::Dcm2niix`]
    pub command: CommandTemplate,
    /// Slice ordering for [`ConverterKind::Builtin`]
    pub sort_by: SortBy,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            kind: ConverterKind::default(),
            command: CommandConverter::dcm2niix(),
            sort_by: SortBy::default(),
        }
    }
}

impl Config {
    /// Loads the configuration following the resolution order above.
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from);
        match Self::resolve_path(cli_path, env_path) {
            Some(path) => Self::from_file(&path),
            None => {
                debug!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Picks the configuration file to read, if any.
    ///
    /// Explicit paths are returned whether or not they exist so that a typo
    /// surfaces as an error instead of silently loading defaults.
    pub fn resolve_path(cli_path: Option<&Path>, env_path: Option<PathBuf>) -> Option<PathBuf> {
        if let Some(path) = cli_path {
            return Some(path.to_path_buf());
        }
        if let Some(path) = env_path.filter(|p| !p.as_os_str().is_empty()) {
            return Some(path);
        }
        dirs::config_dir()
            .map(|dir| dir.join("segfusion").join("config.toml"))
            .filter(|path| path.is_file())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let config = Self::from_toml(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.fusion_options().label()?;

        if !NIFTI_EXTENSIONS.contains(&self.extension.as_str()) {
            return Err(Error::Config(format!(
                "extension must be one of {NIFTI_EXTENSIONS:?}, got '{}'",
                self.extension
            )));
        }
        if self.channels.is_empty() {
            return Err(Error::Config("channels must not be empty".to_string()));
        }
        for (pass, spec) in [(PassId::A, &self.pass_a), (PassId::B, &self.pass_b)] {
            if spec.task.is_empty() {
                return Err(Error::Config(format!("{pass}: task must be set")));
            }
            if spec.folds.is_empty() {
                return Err(Error::Config(format!("{pass}: at least one fold is required")));
            }
            if spec.channels.is_empty() {
                return Err(Error::Config(format!("{pass}: at least one channel is required")));
            }
            if let Some(unknown) = spec.channels.iter().find(|c| !self.channels.contains(c)) {
                return Err(Error::Config(format!(
                    "{pass}: channel {unknown} is not part of the layout {:?}",
                    self.channels
                )));
            }
        }
        Ok(())
    }

    pub fn fusion_options(&self) -> FusionOptions {
        FusionOptions::new(self.tumor_label)
            .keep_base_if_override_empty(self.keep_base_if_override_empty)
            .override_match(self.override_match)
    }

    pub fn tool_timeout(&self) -> Option<Duration> {
        self.tool_timeout_secs.map(Duration::from_secs)
    }

    pub fn pass(&self, pass: PassId) -> &PassSpec {
        match pass {
            PassId::A => &self.pass_a,
            PassId::B => &self.pass_b,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn defaults_describe_the_standard_two_pass_setup() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.tumor_label, 6);
        assert_eq!(config.pass_a.task, "Task006");
        assert_eq!(config.pass_a.channels, ["CT", "PET"]);
        assert_eq!(config.pass_b.task, "Task212");
        assert_eq!(config.pass_b.folds, ["0", "1", "2", "3", "4"]);
        assert_eq!(config.pass_b.channels, ["CT"]);
        assert!(!config.keep_base_if_override_empty);
    }

    #[test]
    fn partial_toml_keeps_defaults_for_missing_keys() {
        let config = Config::from_toml(
            r#"
            output_root = "/data/out"
            tumor_label = 2
            override_match = "any_non_zero"

            [pass_b]
            task = "Task300"
            folds = ["all"]

            [converter]
            kind = "builtin"
            "#,
        )
        .unwrap();

        assert_eq!(config.output_root, PathBuf::from("/data/out"));
        assert_eq!(config.tumor_label, 2);
        assert_eq!(config.override_match, OverrideMatch::AnyNonZero);
        assert_eq!(config.pass_b.task, "Task300");
        assert_eq!(config.pass_b.model, "3d_fullres");
        assert_eq!(config.converter.kind, ConverterKind::Builtin);
        assert_eq!(config.extension, "nii.gz");
    }

    #[test]
    fn validation_rejects_bad_values() {
        let zero_label = Config::from_toml("tumor_label = 0").unwrap_err();
        assert!(matches!(zero_label, Error::InvalidLabel { .. }));

        let bad_ext = Config::from_toml(r#"extension = "mha""#).unwrap_err();
        assert!(matches!(bad_ext, Error::Config(_)));

        let unknown_channel = Config::from_toml(
            r#"
            [pass_a]
            task = "Task006"
            channels = ["CT", "MR"]
            "#,
        )
        .unwrap_err();
        assert!(unknown_channel.to_string().contains("MR"));
    }

    #[test]
    fn explicit_path_wins_over_environment() {
        let cli = Path::new("/etc/cli.toml");
        let env = Some(PathBuf::from("/etc/env.toml"));
        assert_eq!(Config::resolve_path(Some(cli), env.clone()), Some(cli.to_path_buf()));
        assert_eq!(Config::resolve_path(None, env.clone()), env);
    }

    #[test]
    #[serial]
    fn load_reads_file_named_by_environment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "keep_workspace = true\n").unwrap();

        // SAFETY: serialized with every other test touching the variable.
        unsafe { std::env::set_var(CONFIG_ENV_VAR, &path) };
        let loaded = Config::load(None);
        unsafe { std::env::remove_var(CONFIG_ENV_VAR) };

        assert!(loaded.unwrap().keep_workspace);
    }

    #[test]
    #[serial]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }
}
