//! Cache fingerprints derived from declaring files.

use std::path::Path;
use std::time::UNIX_EPOCH;

/// Hashes the path, length and modification time of each file.
///
/// Missing files contribute their path only, so a file appearing or
/// disappearing changes the result. The order of `paths` matters.
pub fn of_files<I, P>(paths: I) -> u64
where
	I: IntoIterator<Item = P>,
	P: AsRef<Path>,
{
	let mut hasher = blake3::Hasher::new();
	for path in paths {
		let path = path.as_ref();
		hasher.update(path.as_os_str().as_encoded_bytes());
		hasher.update(&[0]);
		if let Ok(meta) = std::fs::metadata(path) {
			let mtime = meta
				.modified()
				.ok()
				.and_then(|time| time.duration_since(UNIX_EPOCH).ok())
				.map_or(0, |since| since.as_nanos());
			hasher.update(&meta.len().to_le_bytes());
			hasher.update(&mtime.to_le_bytes());
		}
	}
	let digest = hasher.finalize();
	let mut head = [0u8; 8];
	head.copy_from_slice(&digest.as_bytes()[..8]);
	u64::from_le_bytes(head)
}
