use std::path::PathBuf;

use thiserror::Error;

use crate::objects::{ObjectId, ObjectKind};

/// Errors surfaced by the registry facade and its handles.
#[derive(Error, Debug)]
pub enum RegistryError {
	/// An access-controlled operation was called without the owner's token.
	#[error("unauthorized access to ExtensionRegistry::{operation}; check that the proper access token is supplied")]
	Unauthorized { operation: &'static str },
	/// No live object of the requested kind has this id.
	#[error("{kind} {id} not found")]
	NotFound { id: ObjectId, kind: ObjectKind },
	/// A handle outlived the object it points at.
	#[error("registry object {id} is no longer valid")]
	InvalidObject { id: ObjectId },
	/// A delta view was queried after its event finished dispatching.
	#[error("delta object manager is closed")]
	DeltaClosed,
	/// A required argument was empty.
	#[error("missing argument: {0}")]
	MissingArgument(&'static str),
	/// The registry was stopped; no further writes are accepted.
	#[error("registry is stopped")]
	Stopped,
	#[error("invalid registry configuration: {0}")]
	Config(#[from] toml::de::Error),
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}

/// Failures while reading or writing the on-disk cache.
///
/// These never escape the facade: a failed load means a cold start, a failed
/// store leaves the last published cache in place.
#[derive(Error, Debug)]
pub enum CacheError {
	#[error("cache I/O failed at {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("failed to encode cache section {section}: {source}")]
	Encode {
		section: &'static str,
		#[source]
		source: postcard::Error,
	},
	#[error("failed to decode cache section {section}: {source}")]
	Decode {
		section: &'static str,
		#[source]
		source: postcard::Error,
	},
	#[error("cache section {section} has a bad header")]
	BadMagic { section: &'static str },
	#[error("cache section {section} has schema version {found}")]
	VersionMismatch { section: &'static str, found: u32 },
	#[error("cache fingerprint mismatch: expected {expected:#x}, found {found:#x}")]
	FingerprintMismatch { expected: u64, found: u64 },
	#[error("cache section {section} does not match its manifest checksum")]
	ChecksumMismatch { section: &'static str },
	#[error("cache section {section} is corrupt: {reason}")]
	Corrupt { section: &'static str, reason: String },
	#[error("cache location is read-only")]
	ReadOnly,
}

impl CacheError {
	pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
		Self::Io {
			path: path.into(),
			source,
		}
	}

	pub(crate) fn corrupt(section: &'static str, reason: impl Into<String>) -> Self {
		Self::Corrupt {
			section,
			reason: reason.into(),
		}
	}
}

pub type Result<T, E = RegistryError> = std::result::Result<T, E>;
