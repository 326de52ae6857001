use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{CalcError, CalcResult};

/// Environment variable overriding the location of the configuration file.
pub const ENV_CONFIG_PATH: &str = "CALCKERN_CONFIG";

/// Settings of the Newton root finder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewtonConfig {
    /// Convergence requires the last step to be at most this large.
    pub step_tolerance: f64,
    /// Convergence requires `|f(x)|` to be at most this large.
    pub abs_tolerance: f64,
    pub max_iterations: u32,
    /// Iterates leaving `[lower_bound, upper_bound]` abort the search.
    pub lower_bound: f64,
    pub upper_bound: f64,
}

impl Default for NewtonConfig {
    fn default() -> Self {
        Self {
            step_tolerance: 1e-10,
            abs_tolerance: 1e-10,
            max_iterations: 64,
            lower_bound: f64::NEG_INFINITY,
            upper_bound: f64::INFINITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffConfig {
    /// Largest loop that is unrolled while differentiating `sums` / `prods`.
    pub max_unrolled_iterations: u64,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            max_unrolled_iterations: 4096,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrettyConfig {
    /// Line width used by the pretty printer.
    pub width: usize,
}

impl Default for PrettyConfig {
    fn default() -> Self {
        Self { width: 80 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub newton: NewtonConfig,
    pub diff: DiffConfig,
    pub pretty: PrettyConfig,
}

impl EngineConfig {
    /// Get the default path to the configuration file.
    pub fn default_path() -> PathBuf {
        // Check if the environment variable is set
        if let Ok(config_path) = std::env::var(ENV_CONFIG_PATH) {
            return config_path.into();
        }

        let mut path = PathBuf::new();

        #[cfg(target_os = "windows")]
        {
            if let Ok(appdata) = std::env::var("APPDATA") {
                path.push(appdata);
            }
        }
        #[cfg(not(target_os = "windows"))]
        {
            if let Ok(xdg_config_home) = std::env::var("XDG_CONFIG_HOME") {
                path.push(xdg_config_home);
            } else if let Ok(home) = std::env::var("HOME") {
                path.push(home);
                path.push(".config");
            }
        }

        path.push("calckern");
        path.push("config.toml");
        path
    }

    pub fn from_toml_str(source: &str) -> CalcResult<Self> {
        toml::from_str(source).map_err(|e| CalcError::ConfigParse {
            source: e,
            file: "<string>".to_string(),
        })
    }

    /// Load the configuration from a TOML file.
    pub fn load_from_toml(path: &Path) -> CalcResult<Self> {
        let toml_str = std::fs::read_to_string(path)?;
        let config = toml::from_str(&toml_str).map_err(|e| CalcError::ConfigParse {
            source: e,
            file: path.display().to_string(),
        })?;
        info!("loaded configuration from `{}`", path.display());
        Ok(config)
    }

    /// Load from [`EngineConfig::default_path`], falling back to defaults when no file exists.
    pub fn load_or_default() -> CalcResult<Self> {
        let path = Self::default_path();
        if path.is_file() {
            Self::load_from_toml(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save the configuration to a TOML file, creating parent directories as needed.
    pub fn save_to_toml(&self, path: &Path) -> CalcResult<()> {
        let toml_str = toml::to_string(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, toml_str)?;
        Ok(())
    }
}
