//! On-disk cache of the object store.
//!
//! # Role
//!
//! Lets a registry reopen without re-ingesting every declaration. The store
//! is written at stop and read back at open when the host's fingerprint
//! still matches.
//!
//! # Invariants
//!
//! - A load either yields a store that passed every header, checksum,
//!   fingerprint and integrity check, or an error; the caller then starts
//!   cold. Partial stores are never returned.
//! - A publish is all-or-nothing: the manifest only ever names a fully
//!   written generation.
//!   - Enforced in: `publish::stage_generation`, `publish::commit_manifest`.
//!   - Tested by: `cache::tests::staged_generation_without_manifest_is_ignored`.
//! - The alternative location is only ever read.

pub mod format;
mod publish;

use std::fs;
use std::path::{Path, PathBuf};

use self::format::{EncodedCache, Manifest, Section};
use crate::config::RegistryConfig;
use crate::error::CacheError;
use crate::objects::{ObjectManager, StoreParts};

/// Cache locations of one registry.
#[derive(Debug, Clone)]
pub struct CacheStore {
	primary: Option<PathBuf>,
	alternative: Option<PathBuf>,
	read_only: bool,
}

impl CacheStore {
	/// Builds the store for `config`, or `None` when no location is configured.
	pub fn from_config(config: &RegistryConfig) -> Option<Self> {
		if config.cache_dir.is_none() && config.alternative_cache_dir.is_none() {
			return None;
		}
		Some(Self {
			primary: config.cache_dir.clone(),
			alternative: config.alternative_cache_dir.clone(),
			read_only: config.cache_read_only,
		})
	}

	pub fn new(primary: impl Into<PathBuf>) -> Self {
		Self {
			primary: Some(primary.into()),
			alternative: None,
			read_only: false,
		}
	}

	pub fn with_alternative(mut self, alternative: impl Into<PathBuf>) -> Self {
		self.alternative = Some(alternative.into());
		self
	}

	pub fn read_only(mut self, read_only: bool) -> Self {
		self.read_only = read_only;
		self
	}

	pub fn primary(&self) -> Option<&Path> {
		self.primary.as_deref()
	}

	/// First location holding a manifest: the primary, then the alternative.
	pub fn probe(&self) -> Option<&Path> {
		[self.primary.as_deref(), self.alternative.as_deref()]
			.into_iter()
			.flatten()
			.find(|base| publish::manifest_path(base).is_file())
	}

	/// Loads and validates the cached store.
	pub fn load(&self, fingerprint: u64) -> Result<ObjectManager, CacheError> {
		let Some(base) = self.probe() else {
			return Err(CacheError::corrupt("manifest", "no cache present"));
		};
		let parts = load_parts(base, fingerprint)?;
		tracing::debug!(
			path = %base.display(),
			objects = parts.objects.len(),
			contributions = parts.contributions.len(),
			"registry cache loaded"
		);
		Ok(ObjectManager::from_parts(parts))
	}

	/// Whether [`Self::store`] may write to the primary location.
	pub fn is_writable(&self) -> bool {
		if self.read_only {
			return false;
		}
		let Some(base) = &self.primary else {
			return false;
		};
		if fs::create_dir_all(base).is_err() {
			return false;
		}
		fs::metadata(base).is_ok_and(|meta| !meta.permissions().readonly())
	}

	/// Publishes a new generation to the primary location.
	pub fn store(&self, cache: &EncodedCache) -> Result<u64, CacheError> {
		let base = match &self.primary {
			Some(base) if !self.read_only => base,
			_ => return Err(CacheError::ReadOnly),
		};
		let generation = publish::publish(base, cache)?;
		tracing::debug!(path = %base.display(), generation, "registry cache published");
		Ok(generation)
	}

	/// Removes the published cache from the primary location.
	pub fn clear(&self) -> Result<(), CacheError> {
		let base = match &self.primary {
			Some(base) if !self.read_only => base,
			_ => return Err(CacheError::ReadOnly),
		};
		let manifest = publish::manifest_path(base);
		match fs::remove_file(&manifest) {
			Ok(()) => {}
			Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
			Err(error) => return Err(CacheError::io(manifest, error)),
		}
		publish::remove_stale(base, None);
		Ok(())
	}
}

/// Reads the generation named by the manifest under `base` and decodes it.
pub fn load_parts(base: &Path, fingerprint: u64) -> Result<StoreParts, CacheError> {
	let manifest = publish::read_manifest(base)?.ok_or_else(|| CacheError::corrupt("manifest", "missing"))?;
	if manifest.fingerprint != fingerprint {
		return Err(CacheError::FingerprintMismatch {
			expected: fingerprint,
			found: manifest.fingerprint,
		});
	}
	let cache = read_generation(base, &manifest)?;
	format::decode(&cache, fingerprint)
}

fn read_generation(base: &Path, manifest: &Manifest) -> Result<EncodedCache, CacheError> {
	let dir = publish::generation_dir(base, manifest.generation);
	let mut sections = Vec::with_capacity(Section::DATA.len());
	for section in Section::DATA {
		let path = dir.join(section.file_name());
		let bytes = fs::read(&path).map_err(|e| CacheError::io(path, e))?;
		manifest.verify(section, &bytes)?;
		sections.push((section, bytes));
	}
	Ok(EncodedCache {
		fingerprint: manifest.fingerprint,
		sections,
	})
}

#[cfg(test)]
mod tests;
