//! Registry construction options.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::Result;

/// Options fixed when an [`ExtensionRegistry`](crate::ExtensionRegistry) is opened.
///
/// Every field has a default, so a TOML file only needs the keys it changes:
///
/// ```toml
/// cache_dir = "/var/cache/plexus/registry"
/// cache_read_only = false
/// debug_events = true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
	/// Where the cache is read from and written to. `None` keeps the registry in memory.
	pub cache_dir: Option<PathBuf>,
	/// Read-only location probed when `cache_dir` holds no cache.
	pub alternative_cache_dir: Option<PathBuf>,
	/// Never write the cache.
	pub cache_read_only: bool,
	/// Read the cache at open. The cache may still be written at stop when false.
	pub use_cache: bool,
	/// When false, programmatic ingestion needs the registry's access token.
	pub modifiable: bool,
	/// Log cache load and store timings.
	pub debug: bool,
	/// Log every change event through a built-in listener.
	pub debug_events: bool,
}

impl Default for RegistryConfig {
	fn default() -> Self {
		Self {
			cache_dir: None,
			alternative_cache_dir: None,
			cache_read_only: false,
			use_cache: true,
			modifiable: true,
			debug: false,
			debug_events: false,
		}
	}
}

impl RegistryConfig {
	/// In-memory registry with the given cache location.
	pub fn with_cache_dir(path: impl Into<PathBuf>) -> Self {
		Self {
			cache_dir: Some(path.into()),
			..Self::default()
		}
	}

	pub fn from_toml_str(content: &str) -> Result<Self> {
		Ok(toml::from_str(content)?)
	}

	pub fn load(path: &Path) -> Result<Self> {
		let content = std::fs::read_to_string(path)?;
		Self::from_toml_str(&content)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_empty_toml_is_default() {
		assert_eq!(RegistryConfig::from_toml_str("").unwrap(), RegistryConfig::default());
	}

	#[test]
	fn test_partial_toml_keeps_defaults() {
		let config = RegistryConfig::from_toml_str(
			r#"
			cache_dir = "/tmp/registry"
			cache_read_only = true
			debug_events = true
			"#,
		)
		.unwrap();
		assert_eq!(config.cache_dir.as_deref(), Some(Path::new("/tmp/registry")));
		assert!(config.cache_read_only);
		assert!(config.debug_events);
		assert!(config.use_cache);
		assert!(config.modifiable);
	}

	#[test]
	fn test_unknown_key_is_rejected() {
		let err = RegistryConfig::from_toml_str("cache = 1").unwrap_err();
		assert!(matches!(err, crate::RegistryError::Config(_)));
	}

	#[test]
	fn test_load_reads_file() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("registry.toml");
		std::fs::write(&path, "modifiable = false\n").unwrap();
		let config = RegistryConfig::load(&path).unwrap();
		assert!(!config.modifiable);
	}
}
