//! Registry objects and the arena that owns them.
//!
//! # Role
//!
//! Every live extension point, extension and configuration element sits in
//! one [`ObjectManager`] slot behind a dense [`ObjectId`]. Objects refer to
//! each other only by id, so the extension ↔ extension point relationship
//! never forms a reference cycle.
//!
//! # Invariants
//!
//! - Ids are allocated monotonically and never reused while the store is open.
//! - Objects are immutable once stored. The linker replaces an extension
//!   point's whole `Arc` (with a freshly allocated child slice) instead of
//!   mutating it, so a reader holding an older `Arc` never sees a partial update.
//! - A [`Contribution`] is the only record of which objects a contributor owns.

mod store;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
pub use store::{ObjectManager, StoreParts};

/// Dense identifier of a registry object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u32);

impl ObjectId {
	/// Returns the underlying u32 value.
	#[inline]
	pub fn as_u32(self) -> u32 {
		self.0
	}

	#[inline]
	pub(crate) fn index(self) -> usize {
		self.0 as usize
	}
}

impl fmt::Display for ObjectId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "#{}", self.0)
	}
}

/// Numeric identifier of a module supplying contributions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContributorId(pub u64);

impl fmt::Display for ContributorId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Kind tag stored alongside every arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
	ExtensionPoint,
	Extension,
	ConfigurationElement,
}

impl fmt::Display for ObjectKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::ExtensionPoint => "extension point",
			Self::Extension => "extension",
			Self::ConfigurationElement => "configuration element",
		})
	}
}

/// One contributor's payload: which points and extensions it introduced.
///
/// The raw encoding is `[point_count, extension_count, point ids.., extension ids..]`,
/// which is also what the cache persists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contribution {
	pub(crate) contributor: ContributorId,
	pub(crate) namespace: String,
	pub(crate) raw: Vec<u32>,
}

impl Contribution {
	const POINT_COUNT: usize = 0;
	const EXTENSION_COUNT: usize = 1;
	const HEADER: usize = 2;

	pub(crate) fn new(contributor: ContributorId, namespace: String, points: &[ObjectId], extensions: &[ObjectId]) -> Self {
		let mut raw = Vec::with_capacity(Self::HEADER + points.len() + extensions.len());
		raw.push(points.len() as u32);
		raw.push(extensions.len() as u32);
		raw.extend(points.iter().map(|id| id.0));
		raw.extend(extensions.iter().map(|id| id.0));
		Self {
			contributor,
			namespace,
			raw,
		}
	}

	pub(crate) fn from_raw(contributor: ContributorId, namespace: String, raw: Vec<u32>) -> Option<Self> {
		if raw.len() < Self::HEADER {
			return None;
		}
		let expected = Self::HEADER + raw[Self::POINT_COUNT] as usize + raw[Self::EXTENSION_COUNT] as usize;
		if raw.len() != expected {
			return None;
		}
		Some(Self {
			contributor,
			namespace,
			raw,
		})
	}

	pub fn contributor(&self) -> ContributorId {
		self.contributor
	}

	pub fn namespace(&self) -> &str {
		&self.namespace
	}

	/// Raw children encoding.
	pub fn raw_children(&self) -> &[u32] {
		&self.raw
	}

	pub fn extension_points(&self) -> impl Iterator<Item = ObjectId> + '_ {
		let count = self.raw[Self::POINT_COUNT] as usize;
		self.raw[Self::HEADER..Self::HEADER + count].iter().map(|&id| ObjectId(id))
	}

	pub fn extensions(&self) -> impl Iterator<Item = ObjectId> + '_ {
		let start = Self::HEADER + self.raw[Self::POINT_COUNT] as usize;
		self.raw[start..].iter().map(|&id| ObjectId(id))
	}

	/// Folds a later contribution from the same contributor into this one.
	pub(crate) fn merge(&mut self, other: &Contribution) {
		let points: Vec<ObjectId> = self.extension_points().chain(other.extension_points()).collect();
		let extensions: Vec<ObjectId> = self.extensions().chain(other.extensions()).collect();
		*self = Self::new(self.contributor, std::mem::take(&mut self.namespace), &points, &extensions);
	}
}

/// A named slot other modules may plug extensions into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionPoint {
	pub(crate) id: ObjectId,
	pub(crate) unique_id: String,
	pub(crate) label: String,
	pub(crate) schema: Option<String>,
	pub(crate) namespace: String,
	pub(crate) namespace_owner: ContributorId,
	pub(crate) contributor: ContributorId,
	pub(crate) children: Arc<[ObjectId]>,
}

impl ExtensionPoint {
	pub fn id(&self) -> ObjectId {
		self.id
	}

	/// Fully-qualified identifier (`namespace.localId`).
	pub fn unique_id(&self) -> &str {
		&self.unique_id
	}

	/// Local part of the identifier.
	pub fn simple_id(&self) -> &str {
		simple_part(&self.unique_id)
	}

	pub fn label(&self) -> &str {
		&self.label
	}

	pub fn schema(&self) -> Option<&str> {
		self.schema.as_deref()
	}

	pub fn namespace(&self) -> &str {
		&self.namespace
	}

	pub fn namespace_owner(&self) -> ContributorId {
		self.namespace_owner
	}

	pub fn contributor(&self) -> ContributorId {
		self.contributor
	}

	/// Linked extension ids, in link order.
	pub fn raw_children(&self) -> &Arc<[ObjectId]> {
		&self.children
	}

	/// Returns a copy of this point with a different child list.
	pub(crate) fn with_children(&self, children: Arc<[ObjectId]>) -> Self {
		Self {
			children,
			..self.clone()
		}
	}
}

/// A concrete contribution targeting one extension point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
	pub(crate) id: ObjectId,
	pub(crate) simple_id: Option<String>,
	pub(crate) label: String,
	pub(crate) point_id: String,
	pub(crate) namespace: String,
	pub(crate) contributor: ContributorId,
	pub(crate) children: Arc<[ObjectId]>,
}

impl Extension {
	pub fn id(&self) -> ObjectId {
		self.id
	}

	pub fn simple_id(&self) -> Option<&str> {
		self.simple_id.as_deref()
	}

	/// Fully-qualified identifier, present only for named extensions.
	pub fn unique_id(&self) -> Option<String> {
		self.simple_id.as_ref().map(|simple| qualify(&self.namespace, simple))
	}

	pub fn label(&self) -> &str {
		&self.label
	}

	/// Fully-qualified id of the targeted extension point.
	pub fn extension_point_id(&self) -> &str {
		&self.point_id
	}

	pub fn namespace(&self) -> &str {
		&self.namespace
	}

	pub fn contributor(&self) -> ContributorId {
		self.contributor
	}

	/// Top-level configuration element ids.
	pub fn raw_children(&self) -> &Arc<[ObjectId]> {
		&self.children
	}
}

/// What a configuration element hangs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParentKind {
	Extension,
	ConfigurationElement,
}

/// A node in an extension's content tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationElement {
	pub(crate) id: ObjectId,
	pub(crate) name: String,
	/// Flattened `[key, value, key, value, ..]`.
	pub(crate) properties: Vec<String>,
	pub(crate) value: Option<String>,
	pub(crate) parent: ObjectId,
	pub(crate) parent_kind: ParentKind,
	pub(crate) namespace_owner: ContributorId,
	pub(crate) contributor: ContributorId,
	pub(crate) children: Arc<[ObjectId]>,
}

impl ConfigurationElement {
	pub fn id(&self) -> ObjectId {
		self.id
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn value(&self) -> Option<&str> {
		self.value.as_deref()
	}

	pub fn attribute(&self, key: &str) -> Option<&str> {
		self.properties
			.chunks_exact(2)
			.find(|pair| pair[0] == key)
			.map(|pair| pair[1].as_str())
	}

	pub fn attribute_names(&self) -> impl Iterator<Item = &str> + '_ {
		self.properties.chunks_exact(2).map(|pair| pair[0].as_str())
	}

	pub fn raw_properties(&self) -> &[String] {
		&self.properties
	}

	pub fn parent(&self) -> (ObjectId, ParentKind) {
		(self.parent, self.parent_kind)
	}

	pub fn namespace_owner(&self) -> ContributorId {
		self.namespace_owner
	}

	pub fn contributor(&self) -> ContributorId {
		self.contributor
	}

	pub fn raw_children(&self) -> &Arc<[ObjectId]> {
		&self.children
	}
}

/// An arena slot's content.
#[derive(Debug, Clone)]
pub enum RegistryObject {
	ExtensionPoint(Arc<ExtensionPoint>),
	Extension(Arc<Extension>),
	ConfigurationElement(Arc<ConfigurationElement>),
}

impl RegistryObject {
	pub fn id(&self) -> ObjectId {
		match self {
			Self::ExtensionPoint(point) => point.id,
			Self::Extension(extension) => extension.id,
			Self::ConfigurationElement(element) => element.id,
		}
	}

	pub fn kind(&self) -> ObjectKind {
		match self {
			Self::ExtensionPoint(_) => ObjectKind::ExtensionPoint,
			Self::Extension(_) => ObjectKind::Extension,
			Self::ConfigurationElement(_) => ObjectKind::ConfigurationElement,
		}
	}

	pub fn contributor(&self) -> ContributorId {
		match self {
			Self::ExtensionPoint(point) => point.contributor,
			Self::Extension(extension) => extension.contributor,
			Self::ConfigurationElement(element) => element.contributor,
		}
	}

	pub fn children(&self) -> &Arc<[ObjectId]> {
		match self {
			Self::ExtensionPoint(point) => &point.children,
			Self::Extension(extension) => &extension.children,
			Self::ConfigurationElement(element) => &element.children,
		}
	}

	pub fn as_extension_point(&self) -> Option<&Arc<ExtensionPoint>> {
		match self {
			Self::ExtensionPoint(point) => Some(point),
			_ => None,
		}
	}

	pub fn as_extension(&self) -> Option<&Arc<Extension>> {
		match self {
			Self::Extension(extension) => Some(extension),
			_ => None,
		}
	}

	pub fn as_configuration_element(&self) -> Option<&Arc<ConfigurationElement>> {
		match self {
			Self::ConfigurationElement(element) => Some(element),
			_ => None,
		}
	}
}

/// Joins a namespace and a local id.
pub fn qualify(namespace: &str, local: &str) -> String {
	let mut out = String::with_capacity(namespace.len() + 1 + local.len());
	out.push_str(namespace);
	out.push('.');
	out.push_str(local);
	out
}

/// Splits `namespace.local` at the last dot.
pub fn split_qualified(id: &str) -> Option<(&str, &str)> {
	id.rsplit_once('.')
}

fn simple_part(id: &str) -> &str {
	id.rsplit_once('.').map_or(id, |(_, local)| local)
}
