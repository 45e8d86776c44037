//! All-or-nothing publication of a cache generation.
//!
//! A generation is written into a staging directory, synced, and renamed to
//! `gen-<N>`. Only then is the manifest replaced (temp file + rename) to name
//! it. A crash at any point leaves the previous manifest, and so the previous
//! generation, in effect.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::format::{EncodedCache, Manifest, Section};
use crate::error::CacheError;

const GENERATION_PREFIX: &str = "gen-";
const STAGING_PREFIX: &str = ".staging-";

pub(crate) fn manifest_path(base: &Path) -> PathBuf {
	base.join(Section::Manifest.file_name())
}

pub(crate) fn generation_dir(base: &Path, generation: u64) -> PathBuf {
	base.join(format!("{GENERATION_PREFIX}{generation}"))
}

fn parse_generation(name: &str) -> Option<u64> {
	name.strip_prefix(GENERATION_PREFIX)?.parse().ok()
}

/// Reads and decodes the manifest, if one exists.
pub(crate) fn read_manifest(base: &Path) -> Result<Option<Manifest>, CacheError> {
	let path = manifest_path(base);
	match fs::read(&path) {
		Ok(bytes) => Manifest::decode(&bytes).map(Some),
		Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(error) => Err(CacheError::io(path, error)),
	}
}

/// Highest generation named by the manifest or present on disk.
fn latest_generation(base: &Path) -> Result<u64, CacheError> {
	let mut latest = read_manifest(base).ok().flatten().map_or(0, |manifest| manifest.generation);
	let entries = fs::read_dir(base).map_err(|e| CacheError::io(base, e))?;
	for entry in entries.flatten() {
		if let Some(generation) = entry.file_name().to_str().and_then(parse_generation) {
			latest = latest.max(generation);
		}
	}
	Ok(latest)
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
	let mut file = File::create(path).map_err(|e| CacheError::io(path, e))?;
	file.write_all(bytes).map_err(|e| CacheError::io(path, e))?;
	file.sync_all().map_err(|e| CacheError::io(path, e))
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> Result<(), CacheError> {
	File::open(path)
		.and_then(|dir| dir.sync_all())
		.map_err(|e| CacheError::io(path, e))
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> Result<(), CacheError> {
	Ok(())
}

/// Writes every data section into a fresh `gen-<N>` directory.
///
/// The generation is not live until [`commit_manifest`] names it.
pub(crate) fn stage_generation(base: &Path, cache: &EncodedCache) -> Result<(u64, Manifest), CacheError> {
	fs::create_dir_all(base).map_err(|e| CacheError::io(base, e))?;
	let generation = latest_generation(base)? + 1;

	let staging = tempfile::Builder::new()
		.prefix(STAGING_PREFIX)
		.tempdir_in(base)
		.map_err(|e| CacheError::io(base, e))?;
	for (section, bytes) in &cache.sections {
		write_synced(&staging.path().join(section.file_name()), bytes)?;
	}
	sync_dir(staging.path())?;

	let target = generation_dir(base, generation);
	let staged = staging.keep();
	if let Err(error) = fs::rename(&staged, &target) {
		let _ = fs::remove_dir_all(&staged);
		return Err(CacheError::io(target, error));
	}
	sync_dir(base)?;
	tracing::trace!(generation, path = %target.display(), "cache generation staged");
	Ok((generation, Manifest::for_cache(generation, cache)))
}

/// Atomically replaces the manifest so it names `manifest.generation`.
pub(crate) fn commit_manifest(base: &Path, manifest: &Manifest) -> Result<(), CacheError> {
	let bytes = manifest.encode()?;
	let mut temp = tempfile::NamedTempFile::new_in(base).map_err(|e| CacheError::io(base, e))?;
	temp.write_all(&bytes).map_err(|e| CacheError::io(temp.path(), e))?;
	temp.as_file().sync_all().map_err(|e| CacheError::io(temp.path(), e))?;
	let path = manifest_path(base);
	temp.persist(&path).map_err(|e| CacheError::io(&path, e.error))?;
	sync_dir(base)
}

/// Removes every generation but `keep`, plus abandoned staging directories.
pub(crate) fn remove_stale(base: &Path, keep: Option<u64>) {
	let Ok(entries) = fs::read_dir(base) else {
		return;
	};
	for entry in entries.flatten() {
		let name = entry.file_name();
		let Some(name) = name.to_str() else {
			continue;
		};
		let stale = match parse_generation(name) {
			Some(generation) => Some(generation) != keep,
			None => name.starts_with(STAGING_PREFIX),
		};
		if stale && let Err(error) = fs::remove_dir_all(entry.path()) {
			tracing::debug!(path = %entry.path().display(), error = %error, "failed to remove stale cache directory");
		}
	}
}

/// Stages, commits and cleans up one generation.
pub(crate) fn publish(base: &Path, cache: &EncodedCache) -> Result<u64, CacheError> {
	let (generation, manifest) = stage_generation(base, cache)?;
	commit_manifest(base, &manifest)?;
	remove_stale(base, Some(generation));
	Ok(generation)
}
