use std::fs;
use std::sync::Arc;

use pretty_assertions::assert_eq;

use super::format::{self, EncodedCache, HEADER_SIZE, Section};
use super::{CacheStore, load_parts, publish};
use crate::error::CacheError;
use crate::objects::{
	ConfigurationElement, Contribution, ContributorId, Extension, ExtensionPoint, ObjectId, ObjectManager, ParentKind,
	RegistryObject,
};

const FINGERPRINT: u64 = 0xfeed;

/// Point `A.widgets` with `B.red` linked (carrying one element) and
/// `B.lost` parked as an orphan of `C.missing`.
fn sample_store() -> ObjectManager {
	let mut store = ObjectManager::new();
	let point = store.allocate_id();
	let red = store.allocate_id();
	let element = store.allocate_id();
	let lost = store.allocate_id();
	store.add(
		RegistryObject::ExtensionPoint(Arc::new(ExtensionPoint {
			id: point,
			unique_id: "A.widgets".into(),
			label: "Widgets".into(),
			schema: Some("schema/widgets.exsd".into()),
			namespace: "A".into(),
			namespace_owner: ContributorId(1),
			contributor: ContributorId(1),
			children: Arc::from([red]),
		})),
		true,
	);
	store.add(
		RegistryObject::Extension(Arc::new(Extension {
			id: red,
			simple_id: Some("red".into()),
			label: "Red".into(),
			point_id: "A.widgets".into(),
			namespace: "B".into(),
			contributor: ContributorId(2),
			children: Arc::from([element]),
		})),
		false,
	);
	store.add(
		RegistryObject::ConfigurationElement(Arc::new(ConfigurationElement {
			id: element,
			name: "widget".into(),
			properties: vec!["class".into(), "org.b.Red".into()],
			value: Some("text".into()),
			parent: red,
			parent_kind: ParentKind::Extension,
			namespace_owner: ContributorId(2),
			contributor: ContributorId(2),
			children: Arc::from([]),
		})),
		false,
	);
	store.add(
		RegistryObject::Extension(Arc::new(Extension {
			id: lost,
			simple_id: None,
			label: String::new(),
			point_id: "C.missing".into(),
			namespace: "B".into(),
			contributor: ContributorId(2),
			children: Arc::from([]),
		})),
		false,
	);
	store.add_contribution(Contribution::new(ContributorId(1), "A".into(), &[point], &[]));
	store.add_contribution(Contribution::new(ContributorId(2), "B".into(), &[], &[red, lost]));
	store.add_orphan("C.missing", lost);
	store
}

fn encoded(store: &ObjectManager) -> EncodedCache {
	format::encode(&store.to_parts(), FINGERPRINT).unwrap()
}

fn section_path(base: &std::path::Path, generation: u64, section: Section) -> std::path::PathBuf {
	publish::generation_dir(base, generation).join(section.file_name())
}

/// A published store loads back identically and clean.
#[test]
fn test_store_then_load() {
	let dir = tempfile::tempdir().unwrap();
	let cache = CacheStore::new(dir.path());
	let store = sample_store();
	let original = encoded(&store);
	cache.store(&original).unwrap();

	let loaded = cache.load(FINGERPRINT).unwrap();
	assert!(!loaded.is_dirty());
	assert_eq!(encoded(&loaded).sections, original.sections);

	let point = loaded.point_by_unique_id("A.widgets").unwrap();
	assert_eq!(point.schema(), Some("schema/widgets.exsd"));
	let red = loaded.extension(point.raw_children()[0]).unwrap();
	assert_eq!(red.unique_id().as_deref(), Some("B.red"));
	let element = loaded.configuration_element(red.raw_children()[0]).unwrap();
	assert_eq!(element.attribute("class"), Some("org.b.Red"));
	assert_eq!(element.value(), Some("text"));
	assert_eq!(loaded.orphans_of("C.missing"), Some(&[ObjectId(3)][..]));
}

#[test]
fn test_fingerprint_mismatch_rejects_whole_cache() {
	let dir = tempfile::tempdir().unwrap();
	let cache = CacheStore::new(dir.path());
	cache.store(&encoded(&sample_store())).unwrap();

	let err = cache.load(FINGERPRINT + 1).unwrap_err();
	assert!(matches!(err, CacheError::FingerprintMismatch { found: FINGERPRINT, .. }));
}

#[test]
fn test_missing_section_is_invalid() {
	let dir = tempfile::tempdir().unwrap();
	let cache = CacheStore::new(dir.path());
	let generation = cache.store(&encoded(&sample_store())).unwrap();
	fs::remove_file(section_path(dir.path(), generation, Section::Orphans)).unwrap();

	assert!(matches!(cache.load(FINGERPRINT), Err(CacheError::Io { .. })));
}

#[test]
fn test_corrupt_section_fails_checksum() {
	let dir = tempfile::tempdir().unwrap();
	let cache = CacheStore::new(dir.path());
	let generation = cache.store(&encoded(&sample_store())).unwrap();
	let path = section_path(dir.path(), generation, Section::Main);
	let mut bytes = fs::read(&path).unwrap();
	let last = bytes.len() - 1;
	bytes[last] ^= 0xff;
	fs::write(&path, bytes).unwrap();

	assert!(matches!(
		cache.load(FINGERPRINT),
		Err(CacheError::ChecksumMismatch { section: "main" })
	));
}

/// A generation written but never named by the manifest (a crash before the
/// manifest swap) is invisible; the previous generation stays in effect.
#[test]
fn staged_generation_without_manifest_is_ignored() {
	let dir = tempfile::tempdir().unwrap();
	let cache = CacheStore::new(dir.path());
	let first = cache.store(&encoded(&sample_store())).unwrap();

	let empty = encoded(&ObjectManager::new());
	let (staged, _) = publish::stage_generation(dir.path(), &empty).unwrap();
	assert_eq!(staged, first + 1);

	let loaded = cache.load(FINGERPRINT).unwrap();
	assert!(loaded.point_by_unique_id("A.widgets").is_some());

	let next = cache.store(&empty).unwrap();
	assert_eq!(next, staged + 1);
	assert!(cache.load(FINGERPRINT).unwrap().is_empty());
	assert!(!publish::generation_dir(dir.path(), first).exists());
	assert!(!publish::generation_dir(dir.path(), staged).exists());
}

#[test]
fn test_alternative_location_is_read_only() {
	let primary = tempfile::tempdir().unwrap();
	let alternative = tempfile::tempdir().unwrap();
	CacheStore::new(alternative.path()).store(&encoded(&sample_store())).unwrap();

	let cache = CacheStore::new(primary.path()).with_alternative(alternative.path());
	assert_eq!(cache.probe(), Some(alternative.path()));
	assert!(cache.load(FINGERPRINT).is_ok());

	let read_only = cache.clone().read_only(true);
	assert!(!read_only.is_writable());
	assert!(matches!(read_only.store(&encoded(&sample_store())), Err(CacheError::ReadOnly)));
}

#[test]
fn test_clear_forces_cold_start() {
	let dir = tempfile::tempdir().unwrap();
	let cache = CacheStore::new(dir.path());
	cache.store(&encoded(&sample_store())).unwrap();
	cache.clear().unwrap();

	assert!(cache.probe().is_none());
	assert!(cache.load(FINGERPRINT).is_err());
	assert!(load_parts(dir.path(), FINGERPRINT).is_err());
}

#[test]
fn test_header_is_checked() {
	let wrapped = format::wrap(Section::Orphans, b"body");
	assert_eq!(format::unwrap(Section::Orphans, &wrapped).unwrap(), b"body");
	assert!(matches!(
		format::unwrap(Section::Table, &wrapped),
		Err(CacheError::BadMagic { section: "table" })
	));

	let mut newer = wrapped.clone();
	newer[8..12].copy_from_slice(&(format::SCHEMA_VERSION + 1).to_le_bytes());
	assert!(matches!(
		format::unwrap(Section::Orphans, &newer),
		Err(CacheError::VersionMismatch { .. })
	));
	assert!(format::unwrap(Section::Orphans, &wrapped[..HEADER_SIZE - 1]).is_err());
}

/// Dangling references never make it into a store.
#[test]
fn test_integrity_rejects_dangling_child() {
	let mut parts = sample_store().to_parts();
	parts.orphans.push(("D.gone".into(), vec![ObjectId(0)]));
	assert!(matches!(
		format::check_integrity(&parts),
		Err(CacheError::Corrupt { section: "orphans", .. })
	));

	let mut parts = sample_store().to_parts();
	parts.next_id = 2;
	assert!(matches!(format::check_integrity(&parts), Err(CacheError::Corrupt { .. })));
}
