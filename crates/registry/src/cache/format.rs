//! Section encoding for the registry cache.
//!
//! Every section is `MAGIC | SCHEMA_VERSION (u32 LE) | tag (4 bytes) | body`,
//! with a postcard body. The table section indexes the main section by byte
//! range; main records point into the extra section for their strings.

use std::mem::size_of;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::objects::{
	ConfigurationElement, Contribution, ContributorId, Extension, ExtensionPoint, ObjectId, ObjectKind, ParentKind,
	RegistryObject, StoreParts,
};

/// Magic bytes identifying a registry cache section.
pub const MAGIC: &[u8; 8] = b"PLXSRGCH";

/// Schema version for cache format compatibility.
pub const SCHEMA_VERSION: u32 = 1;

/// Total header size in bytes (magic + version + tag).
pub const HEADER_SIZE: usize = MAGIC.len() + size_of::<u32>() + 4;

/// The files making up one cache generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
	Table,
	Main,
	Extra,
	Contributions,
	Orphans,
	Manifest,
}

impl Section {
	/// Sections stored inside a generation directory, in write order.
	pub const DATA: [Section; 5] = [
		Section::Table,
		Section::Main,
		Section::Extra,
		Section::Contributions,
		Section::Orphans,
	];

	pub fn name(self) -> &'static str {
		match self {
			Self::Table => "table",
			Self::Main => "main",
			Self::Extra => "extra",
			Self::Contributions => "contributions",
			Self::Orphans => "orphans",
			Self::Manifest => "manifest",
		}
	}

	pub fn file_name(self) -> &'static str {
		match self {
			Self::Table => "table.bin",
			Self::Main => "main.bin",
			Self::Extra => "extra.bin",
			Self::Contributions => "contributions.bin",
			Self::Orphans => "orphans.bin",
			Self::Manifest => "registry.manifest",
		}
	}

	fn tag(self) -> &'static [u8; 4] {
		match self {
			Self::Table => b"TABL",
			Self::Main => b"MAIN",
			Self::Extra => b"XTRA",
			Self::Contributions => b"CONT",
			Self::Orphans => b"ORPH",
			Self::Manifest => b"MNFT",
		}
	}
}

/// Prefixes `body` with the section header.
pub fn wrap(section: Section, body: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
	out.extend_from_slice(MAGIC);
	out.extend_from_slice(&SCHEMA_VERSION.to_le_bytes());
	out.extend_from_slice(section.tag());
	out.extend_from_slice(body);
	out
}

/// Validates the section header and returns the body.
pub fn unwrap(section: Section, data: &[u8]) -> Result<&[u8], CacheError> {
	let name = section.name();
	if data.len() < HEADER_SIZE || &data[..MAGIC.len()] != MAGIC {
		return Err(CacheError::BadMagic { section: name });
	}
	let mut version = [0u8; 4];
	version.copy_from_slice(&data[MAGIC.len()..MAGIC.len() + 4]);
	let found = u32::from_le_bytes(version);
	if found != SCHEMA_VERSION {
		return Err(CacheError::VersionMismatch { section: name, found });
	}
	if &data[MAGIC.len() + 4..HEADER_SIZE] != section.tag() {
		return Err(CacheError::BadMagic { section: name });
	}
	Ok(&data[HEADER_SIZE..])
}

fn to_bytes<T: Serialize + ?Sized>(section: Section, value: &T) -> Result<Vec<u8>, CacheError> {
	postcard::to_allocvec(value).map_err(|source| CacheError::Encode {
		section: section.name(),
		source,
	})
}

fn from_bytes<T: DeserializeOwned>(section: Section, body: &[u8]) -> Result<T, CacheError> {
	postcard::from_bytes(body).map_err(|source| CacheError::Decode {
		section: section.name(),
		source,
	})
}

#[derive(Debug, Serialize, Deserialize)]
struct TableSection {
	fingerprint: u64,
	next_id: u32,
	entries: Vec<TableEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TableEntry {
	id: u32,
	kind: ObjectKind,
	offset: u32,
	len: u32,
}

#[derive(Debug, Serialize, Deserialize)]
enum MainRecord {
	ExtensionPoint {
		namespace_owner: u64,
		contributor: u64,
		children: Vec<u32>,
		extra: u32,
	},
	Extension {
		contributor: u64,
		children: Vec<u32>,
		extra: u32,
	},
	ConfigurationElement {
		parent: u32,
		parent_kind: ParentKind,
		namespace_owner: u64,
		contributor: u64,
		children: Vec<u32>,
		extra: u32,
	},
}

impl MainRecord {
	fn kind(&self) -> ObjectKind {
		match self {
			Self::ExtensionPoint { .. } => ObjectKind::ExtensionPoint,
			Self::Extension { .. } => ObjectKind::Extension,
			Self::ConfigurationElement { .. } => ObjectKind::ConfigurationElement,
		}
	}
}

#[derive(Debug, Serialize, Deserialize)]
enum ExtraRecord {
	ExtensionPoint {
		unique_id: String,
		label: String,
		schema: Option<String>,
		namespace: String,
	},
	Extension {
		simple_id: Option<String>,
		label: String,
		point_id: String,
		namespace: String,
	},
	ConfigurationElement {
		name: String,
		properties: Vec<String>,
		value: Option<String>,
	},
}

#[derive(Debug, Serialize, Deserialize)]
struct ContributionRecord {
	contributor: u64,
	namespace: String,
	raw: Vec<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OrphanRecord {
	point_id: String,
	extensions: Vec<u32>,
}

/// One generation's sections, header included, ready to be written.
#[derive(Debug, Clone)]
pub struct EncodedCache {
	pub fingerprint: u64,
	pub sections: Vec<(Section, Vec<u8>)>,
}

impl EncodedCache {
	pub fn section(&self, section: Section) -> Option<&[u8]> {
		self.sections
			.iter()
			.find(|(candidate, _)| *candidate == section)
			.map(|(_, bytes)| bytes.as_slice())
	}
}

fn ids(children: &[ObjectId]) -> Vec<u32> {
	children.iter().map(|id| id.0).collect()
}

/// Encodes a store snapshot into its five sections.
pub fn encode(parts: &StoreParts, fingerprint: u64) -> Result<EncodedCache, CacheError> {
	let mut main = Vec::new();
	let mut extra = Vec::with_capacity(parts.objects.len());
	let mut entries = Vec::with_capacity(parts.objects.len());

	for object in &parts.objects {
		let extra_index = extra.len() as u32;
		let record = match object {
			RegistryObject::ExtensionPoint(point) => {
				extra.push(ExtraRecord::ExtensionPoint {
					unique_id: point.unique_id.clone(),
					label: point.label.clone(),
					schema: point.schema.clone(),
					namespace: point.namespace.clone(),
				});
				MainRecord::ExtensionPoint {
					namespace_owner: point.namespace_owner.0,
					contributor: point.contributor.0,
					children: ids(&point.children),
					extra: extra_index,
				}
			}
			RegistryObject::Extension(extension) => {
				extra.push(ExtraRecord::Extension {
					simple_id: extension.simple_id.clone(),
					label: extension.label.clone(),
					point_id: extension.point_id.clone(),
					namespace: extension.namespace.clone(),
				});
				MainRecord::Extension {
					contributor: extension.contributor.0,
					children: ids(&extension.children),
					extra: extra_index,
				}
			}
			RegistryObject::ConfigurationElement(element) => {
				extra.push(ExtraRecord::ConfigurationElement {
					name: element.name.clone(),
					properties: element.properties.clone(),
					value: element.value.clone(),
				});
				MainRecord::ConfigurationElement {
					parent: element.parent.0,
					parent_kind: element.parent_kind,
					namespace_owner: element.namespace_owner.0,
					contributor: element.contributor.0,
					children: ids(&element.children),
					extra: extra_index,
				}
			}
		};
		let bytes = to_bytes(Section::Main, &record)?;
		entries.push(TableEntry {
			id: object.id().0,
			kind: object.kind(),
			offset: main.len() as u32,
			len: bytes.len() as u32,
		});
		main.extend_from_slice(&bytes);
	}

	let table = TableSection {
		fingerprint,
		next_id: parts.next_id,
		entries,
	};
	let contributions: Vec<ContributionRecord> = parts
		.contributions
		.iter()
		.map(|contribution| ContributionRecord {
			contributor: contribution.contributor.0,
			namespace: contribution.namespace.clone(),
			raw: contribution.raw.clone(),
		})
		.collect();
	let orphans: Vec<OrphanRecord> = parts
		.orphans
		.iter()
		.map(|(point_id, extensions)| OrphanRecord {
			point_id: point_id.clone(),
			extensions: ids(extensions),
		})
		.collect();

	Ok(EncodedCache {
		fingerprint,
		sections: vec![
			(Section::Table, wrap(Section::Table, &to_bytes(Section::Table, &table)?)),
			(Section::Main, wrap(Section::Main, &main)),
			(Section::Extra, wrap(Section::Extra, &to_bytes(Section::Extra, &extra)?)),
			(
				Section::Contributions,
				wrap(Section::Contributions, &to_bytes(Section::Contributions, &contributions)?),
			),
			(Section::Orphans, wrap(Section::Orphans, &to_bytes(Section::Orphans, &orphans)?)),
		],
	})
}

/// Decodes the five sections back into store parts.
///
/// Rejects a fingerprint other than `expected` and runs [`check_integrity`]
/// before returning.
pub fn decode(sections: &EncodedCache, expected: u64) -> Result<StoreParts, CacheError> {
	let section = |section: Section| {
		sections
			.section(section)
			.ok_or_else(|| CacheError::corrupt(section.name(), "section missing"))
			.and_then(|bytes| unwrap(section, bytes))
	};

	let table: TableSection = from_bytes(Section::Table, section(Section::Table)?)?;
	if table.fingerprint != expected {
		return Err(CacheError::FingerprintMismatch {
			expected,
			found: table.fingerprint,
		});
	}
	let main = section(Section::Main)?;
	let mut extra: Vec<Option<ExtraRecord>> = from_bytes::<Vec<ExtraRecord>>(Section::Extra, section(Section::Extra)?)?
		.into_iter()
		.map(Some)
		.collect();

	let mut objects = Vec::with_capacity(table.entries.len());
	for entry in &table.entries {
		let start = entry.offset as usize;
		let end = start
			.checked_add(entry.len as usize)
			.filter(|&end| end <= main.len())
			.ok_or_else(|| CacheError::corrupt("table", format!("entry {} points past the main section", entry.id)))?;
		let record: MainRecord = from_bytes(Section::Main, &main[start..end])?;
		if record.kind() != entry.kind {
			return Err(CacheError::corrupt("main", format!("record {} has the wrong kind", entry.id)));
		}
		objects.push(rebuild(ObjectId(entry.id), record, &mut extra)?);
	}

	let contributions = from_bytes::<Vec<ContributionRecord>>(Section::Contributions, section(Section::Contributions)?)?
		.into_iter()
		.map(|record| {
			let contributor = ContributorId(record.contributor);
			Contribution::from_raw(contributor, record.namespace, record.raw)
				.ok_or_else(|| CacheError::corrupt("contributions", format!("contributor {contributor} has a bad header")))
		})
		.collect::<Result<Vec<_>, _>>()?;

	let orphans = from_bytes::<Vec<OrphanRecord>>(Section::Orphans, section(Section::Orphans)?)?
		.into_iter()
		.map(|record| (record.point_id, record.extensions.into_iter().map(ObjectId).collect()))
		.collect();

	let parts = StoreParts {
		next_id: table.next_id,
		objects,
		contributions,
		orphans,
	};
	check_integrity(&parts)?;
	Ok(parts)
}

fn rebuild(id: ObjectId, record: MainRecord, extra: &mut [Option<ExtraRecord>]) -> Result<RegistryObject, CacheError> {
	let mut take = |index: u32| {
		extra
			.get_mut(index as usize)
			.and_then(Option::take)
			.ok_or_else(|| CacheError::corrupt("extra", format!("record {id} references missing strings")))
	};
	let children = |children: Vec<u32>| children.into_iter().map(ObjectId).collect();
	let mismatch = || CacheError::corrupt("extra", format!("record {id} has strings of another kind"));

	Ok(match record {
		MainRecord::ExtensionPoint {
			namespace_owner,
			contributor,
			children: kids,
			extra: strings,
		} => {
			let ExtraRecord::ExtensionPoint {
				unique_id,
				label,
				schema,
				namespace,
			} = take(strings)?
			else {
				return Err(mismatch());
			};
			RegistryObject::ExtensionPoint(
				ExtensionPoint {
					id,
					unique_id,
					label,
					schema,
					namespace,
					namespace_owner: ContributorId(namespace_owner),
					contributor: ContributorId(contributor),
					children: children(kids),
				}
				.into(),
			)
		}
		MainRecord::Extension {
			contributor,
			children: kids,
			extra: strings,
		} => {
			let ExtraRecord::Extension {
				simple_id,
				label,
				point_id,
				namespace,
			} = take(strings)?
			else {
				return Err(mismatch());
			};
			RegistryObject::Extension(
				Extension {
					id,
					simple_id,
					label,
					point_id,
					namespace,
					contributor: ContributorId(contributor),
					children: children(kids),
				}
				.into(),
			)
		}
		MainRecord::ConfigurationElement {
			parent,
			parent_kind,
			namespace_owner,
			contributor,
			children: kids,
			extra: strings,
		} => {
			let ExtraRecord::ConfigurationElement { name, properties, value } = take(strings)? else {
				return Err(mismatch());
			};
			if properties.len() % 2 != 0 {
				return Err(CacheError::corrupt("extra", format!("record {id} has an odd property array")));
			}
			RegistryObject::ConfigurationElement(
				ConfigurationElement {
					id,
					name,
					properties,
					value,
					parent: ObjectId(parent),
					parent_kind,
					namespace_owner: ContributorId(namespace_owner),
					contributor: ContributorId(contributor),
					children: children(kids),
				}
				.into(),
			)
		}
	})
}

/// Structural validation of decoded parts.
///
/// Every id must be below `next_id` and unique, every child and parent
/// reference must name an object of the expected kind, and contributions and
/// orphans may only name objects that exist.
pub fn check_integrity(parts: &StoreParts) -> Result<(), CacheError> {
	let mut kinds = vec![None; parts.next_id as usize];
	for object in &parts.objects {
		let slot = kinds
			.get_mut(object.id().index())
			.ok_or_else(|| CacheError::corrupt("table", format!("id {} is out of range", object.id())))?;
		if slot.replace(object.kind()).is_some() {
			return Err(CacheError::corrupt("table", format!("id {} appears twice", object.id())));
		}
	}
	let expect = |section: &'static str, id: ObjectId, kind: ObjectKind| {
		if kinds.get(id.index()).copied().flatten() == Some(kind) {
			Ok(())
		} else {
			Err(CacheError::corrupt(section, format!("{id} is not a live {kind}")))
		}
	};

	for object in &parts.objects {
		let child_kind = match object {
			RegistryObject::ExtensionPoint(_) => ObjectKind::Extension,
			RegistryObject::Extension(_) | RegistryObject::ConfigurationElement(_) => ObjectKind::ConfigurationElement,
		};
		for &child in object.children().iter() {
			expect("main", child, child_kind)?;
		}
		if let RegistryObject::ConfigurationElement(element) = object {
			let parent_kind = match element.parent_kind {
				ParentKind::Extension => ObjectKind::Extension,
				ParentKind::ConfigurationElement => ObjectKind::ConfigurationElement,
			};
			expect("main", element.parent, parent_kind)?;
		}
	}
	for contribution in &parts.contributions {
		for point in contribution.extension_points() {
			expect("contributions", point, ObjectKind::ExtensionPoint)?;
		}
		for extension in contribution.extensions() {
			expect("contributions", extension, ObjectKind::Extension)?;
		}
	}
	for (_, extensions) in &parts.orphans {
		for &extension in extensions {
			expect("orphans", extension, ObjectKind::Extension)?;
		}
	}
	Ok(())
}

/// Per-section digest recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionDigest {
	pub file: String,
	pub len: u64,
	pub hash: [u8; 32],
}

/// Commit record naming the live generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
	pub generation: u64,
	pub fingerprint: u64,
	pub sections: Vec<SectionDigest>,
}

impl Manifest {
	pub fn for_cache(generation: u64, cache: &EncodedCache) -> Self {
		Self {
			generation,
			fingerprint: cache.fingerprint,
			sections: cache
				.sections
				.iter()
				.map(|(section, bytes)| SectionDigest {
					file: section.file_name().to_owned(),
					len: bytes.len() as u64,
					hash: *blake3::hash(bytes).as_bytes(),
				})
				.collect(),
		}
	}

	pub fn digest(&self, section: Section) -> Option<&SectionDigest> {
		self.sections.iter().find(|digest| digest.file == section.file_name())
	}

	/// Checks a section's bytes against the recorded length and hash.
	pub fn verify(&self, section: Section, bytes: &[u8]) -> Result<(), CacheError> {
		let digest = self
			.digest(section)
			.ok_or_else(|| CacheError::corrupt("manifest", format!("no digest for {}", section.name())))?;
		if digest.len != bytes.len() as u64 || digest.hash != *blake3::hash(bytes).as_bytes() {
			return Err(CacheError::ChecksumMismatch {
				section: section.name(),
			});
		}
		Ok(())
	}

	pub fn encode(&self) -> Result<Vec<u8>, CacheError> {
		Ok(wrap(Section::Manifest, &to_bytes(Section::Manifest, self)?))
	}

	pub fn decode(data: &[u8]) -> Result<Self, CacheError> {
		from_bytes(Section::Manifest, unwrap(Section::Manifest, data)?)
	}
}
