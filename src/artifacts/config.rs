//! Configuration for the artifact cache.

use serde::Deserialize;

use crate::error::ArtifactError;

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ArtifactCacheConfig {
  /// Upper bound on the summed payload size in bytes (default: 500 MiB).
  #[serde(default = "default_max_size")]
  pub max_size: u64,

  /// Upper bound on the number of cached artifacts (default: 10).
  #[serde(default = "default_max_models")]
  pub max_models: u64,

  /// Fraction of each bound that cleanup evicts down to (default: 0.8).
  #[serde(default = "default_cleanup_threshold")]
  pub cleanup_threshold: f64,

  /// Run cleanup after every add (default: true).
  #[serde(default = "default_auto_cleanup")]
  pub auto_cleanup: bool,
}

fn default_max_size() -> u64 {
  500 * 1024 * 1024
}

fn default_max_models() -> u64 {
  10
}

fn default_cleanup_threshold() -> f64 {
  0.8
}

fn default_auto_cleanup() -> bool {
  true
}

impl Default for ArtifactCacheConfig {
  fn default() -> Self {
    Self {
      max_size: default_max_size(),
      max_models: default_max_models(),
      cleanup_threshold: default_cleanup_threshold(),
      auto_cleanup: default_auto_cleanup(),
    }
  }
}

impl ArtifactCacheConfig {
  pub fn validate(&self) -> Result<(), ArtifactError> {
    if self.max_size == 0 {
      return Err(ArtifactError::InvalidConfig(
        "max_size must be greater than 0".into(),
      ));
    }
    if self.max_models == 0 {
      return Err(ArtifactError::InvalidConfig(
        "max_models must be greater than 0".into(),
      ));
    }
    if !(self.cleanup_threshold > 0.0 && self.cleanup_threshold <= 1.0) {
      return Err(ArtifactError::InvalidConfig(format!(
        "cleanup_threshold must be in (0, 1], got {}",
        self.cleanup_threshold
      )));
    }
    Ok(())
  }

  /// Size above which cleanup starts evicting.
  pub fn size_limit(&self) -> f64 {
    self.max_size as f64 * self.cleanup_threshold
  }

  /// Largest single payload that survives cleanup, in whole bytes.
  pub fn max_payload(&self) -> u64 {
    self.size_limit().floor() as u64
  }

  /// Count above which cleanup starts evicting.
  pub fn count_limit(&self) -> f64 {
    self.max_models as f64 * self.cleanup_threshold
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = ArtifactCacheConfig::default();
    assert_eq!(config.max_models, 10);
    assert_eq!(config.cleanup_threshold, 0.8);
    assert!(config.auto_cleanup);
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_threshold_out_of_range() {
    for threshold in [0.0, 1.5, f64::NAN] {
      let config = ArtifactCacheConfig {
        cleanup_threshold: threshold,
        ..Default::default()
      };
      assert!(config.validate().is_err(), "threshold {} accepted", threshold);
    }
  }

  #[test]
  fn test_partial_yaml_uses_defaults() {
    let config: ArtifactCacheConfig = serde_yaml::from_str("max_models: 3\n").unwrap();
    assert_eq!(config.max_models, 3);
    assert_eq!(config.max_size, 500 * 1024 * 1024);
  }
}
