use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// RapidPro host used when neither the command line nor the config names one.
pub const DEFAULT_ADDRESS: &str = "rapidpro.io";

/// HTTP timeout used when the config does not set `timeout_secs`.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Optional settings file. Every key can also be given on the command line,
/// which takes precedence.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  /// RapidPro host or base URL
  pub address: Option<String>,
  pub api_token: Option<String>,
  /// Cache database URL (see [`CacheLocation::parse`])
  pub cache: Option<String>,
  pub timeout_secs: Option<u64>,
  /// Write logs here in addition to stderr
  pub log_file: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./rapidpro-pull.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/rapidpro-pull/config.yaml
  ///
  /// Without any config file the defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("rapidpro-pull.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("rapidpro-pull").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Get the RapidPro API token from the environment.
  ///
  /// Checks RAPIDPRO_API_TOKEN; an empty value counts as unset.
  pub fn get_api_token() -> Option<String> {
    std::env::var("RAPIDPRO_API_TOKEN")
      .ok()
      .filter(|token| !token.is_empty())
  }
}

/// Where the cache database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLocation {
  Memory,
  File(PathBuf),
}

impl CacheLocation {
  /// Parse a cache URL.
  ///
  /// Follows the SQLAlchemy form: `sqlite:///relative/path`,
  /// `sqlite:////absolute/path`, and `sqlite://` or `sqlite:///:memory:` for an
  /// in-memory cache. Bare filesystem paths are accepted too. Other URL
  /// schemes are rejected.
  pub fn parse(url: &str) -> Result<Self> {
    let url = url.trim();

    let path = match url.split_once("://") {
      Some(("sqlite", rest)) => rest.strip_prefix('/').unwrap_or(rest),
      Some((scheme, _)) => {
        return Err(eyre!(
          "Unsupported cache URL scheme '{}'; only sqlite is supported",
          scheme
        ))
      }
      None => url,
    };

    match path {
      "" | ":memory:" => Ok(CacheLocation::Memory),
      p => Ok(CacheLocation::File(PathBuf::from(p))),
    }
  }
}
