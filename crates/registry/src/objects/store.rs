//! Dense-id arena holding every live registry object.

use std::sync::Arc;

use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};

use super::{
	ConfigurationElement, Contribution, ContributorId, Extension, ExtensionPoint, ObjectId, ObjectKind, RegistryObject,
};
use crate::error::{RegistryError, Result};

/// Everything the cache persists, in a form the codec can walk.
#[derive(Debug, Default)]
pub struct StoreParts {
	pub next_id: u32,
	pub objects: Vec<RegistryObject>,
	pub contributions: Vec<Contribution>,
	pub orphans: Vec<(String, Vec<ObjectId>)>,
}

/// Owner of all registry objects, the contribution list and the orphan table.
///
/// Mutations go through `&mut self` and are therefore serialized by the
/// registry's write lock. Any mutation marks the store dirty, which gates the
/// cache flush at stop.
#[derive(Debug, Default)]
pub struct ObjectManager {
	slots: Vec<Option<RegistryObject>>,
	/// Extension point unique id → point id.
	points_by_unique_id: FxHashMap<String, ObjectId>,
	contributions: IndexMap<ContributorId, Contribution>,
	/// Extension point unique id → extensions that named it before it existed.
	orphans: FxHashMap<String, Vec<ObjectId>>,
	dirty: bool,
}

impl ObjectManager {
	pub fn new() -> Self {
		Self::default()
	}

	/// Rehydrates a store from cached parts without marking it dirty.
	///
	/// Objects are inserted unindexed and cross-indexed once at the end.
	pub fn from_parts(parts: StoreParts) -> Self {
		let mut store = Self::default();
		store.slots.resize_with(parts.next_id as usize, || None);
		for object in parts.objects {
			store.add(object, false);
		}
		store.rebuild_index();
		for contribution in parts.contributions {
			store.contributions.insert(contribution.contributor, contribution);
		}
		store.orphans = parts.orphans.into_iter().collect();
		store.dirty = false;
		store
	}

	/// Flattens the store into codec-ready parts, in id order.
	pub fn to_parts(&self) -> StoreParts {
		let mut orphans: Vec<(String, Vec<ObjectId>)> =
			self.orphans.iter().map(|(point, ids)| (point.clone(), ids.clone())).collect();
		orphans.sort_by(|a, b| a.0.cmp(&b.0));
		StoreParts {
			next_id: self.slots.len() as u32,
			objects: self.slots.iter().flatten().cloned().collect(),
			contributions: self.contributions.values().cloned().collect(),
			orphans,
		}
	}

	/// Reserves the next id. Ids are never handed out twice.
	pub fn allocate_id(&mut self) -> ObjectId {
		let id = ObjectId(self.slots.len() as u32);
		self.slots.push(None);
		id
	}

	/// Stores `object` in its slot, optionally indexing it by unique id.
	///
	/// `index = false` is used during bulk cache loads, followed by one
	/// [`Self::rebuild_index`].
	pub fn add(&mut self, object: RegistryObject, index: bool) -> ObjectId {
		let id = object.id();
		if id.index() >= self.slots.len() {
			self.slots.resize_with(id.index() + 1, || None);
		}
		if index && let RegistryObject::ExtensionPoint(point) = &object {
			self.points_by_unique_id.insert(point.unique_id.clone(), id);
		}
		self.slots[id.index()] = Some(object);
		self.dirty = true;
		id
	}

	fn rebuild_index(&mut self) {
		self.points_by_unique_id = self
			.slots
			.iter()
			.flatten()
			.filter_map(|object| object.as_extension_point())
			.map(|point| (point.unique_id.clone(), point.id))
			.collect();
	}

	/// Looks up an object, checking its kind.
	pub fn get(&self, id: ObjectId, kind: ObjectKind) -> Result<&RegistryObject> {
		match self.slots.get(id.index()).and_then(Option::as_ref) {
			Some(object) if object.kind() == kind => Ok(object),
			_ => Err(RegistryError::NotFound { id, kind }),
		}
	}

	pub fn object(&self, id: ObjectId) -> Option<&RegistryObject> {
		self.slots.get(id.index()).and_then(Option::as_ref)
	}

	pub fn extension_point(&self, id: ObjectId) -> Option<&Arc<ExtensionPoint>> {
		self.object(id).and_then(RegistryObject::as_extension_point)
	}

	pub fn extension(&self, id: ObjectId) -> Option<&Arc<Extension>> {
		self.object(id).and_then(RegistryObject::as_extension)
	}

	pub fn configuration_element(&self, id: ObjectId) -> Option<&Arc<ConfigurationElement>> {
		self.object(id).and_then(RegistryObject::as_configuration_element)
	}

	/// Finds a live extension point by its fully-qualified id.
	pub fn point_by_unique_id(&self, unique_id: &str) -> Option<&Arc<ExtensionPoint>> {
		let id = *self.points_by_unique_id.get(unique_id)?;
		self.extension_point(id)
	}

	/// Replaces a point's child list. The previous `Arc` stays intact for
	/// anyone still holding it.
	pub(crate) fn set_point_children(&mut self, id: ObjectId, children: Arc<[ObjectId]>) -> Option<Arc<ExtensionPoint>> {
		let point = self.extension_point(id)?;
		let updated = Arc::new(point.with_children(children));
		self.slots[id.index()] = Some(RegistryObject::ExtensionPoint(updated.clone()));
		self.dirty = true;
		Some(updated)
	}

	/// Removes objects from the arena and returns them. Slots stay allocated.
	pub fn remove(&mut self, ids: &[ObjectId]) -> Vec<RegistryObject> {
		let mut removed = Vec::with_capacity(ids.len());
		for &id in ids {
			let Some(object) = self.slots.get_mut(id.index()).and_then(Option::take) else {
				continue;
			};
			if let RegistryObject::ExtensionPoint(point) = &object
				&& self.points_by_unique_id.get(&point.unique_id) == Some(&id)
			{
				self.points_by_unique_id.remove(&point.unique_id);
			}
			removed.push(object);
		}
		if !removed.is_empty() {
			self.dirty = true;
		}
		removed
	}

	/// Ids of the given kind introduced by a contributor.
	pub fn objects_from(&self, contributor: ContributorId, kind: ObjectKind) -> Vec<ObjectId> {
		let Some(contribution) = self.contributions.get(&contributor) else {
			return Vec::new();
		};
		match kind {
			ObjectKind::ExtensionPoint => contribution.extension_points().collect(),
			ObjectKind::Extension => contribution.extensions().collect(),
			ObjectKind::ConfigurationElement => {
				let mut out = Vec::new();
				for extension in contribution.extensions() {
					if let Some(object) = self.object(extension) {
						self.collect_subtree(object.children(), &mut out);
					}
				}
				out
			}
		}
	}

	/// Every object a contributor owns: points, extensions and their element trees.
	pub fn associated_objects(&self, contributor: ContributorId) -> Vec<ObjectId> {
		let Some(contribution) = self.contributions.get(&contributor) else {
			return Vec::new();
		};
		let mut out: Vec<ObjectId> = contribution.extension_points().collect();
		for extension in contribution.extensions() {
			out.push(extension);
			if let Some(object) = self.object(extension) {
				self.collect_subtree(object.children(), &mut out);
			}
		}
		out
	}

	/// Depth-first walk over configuration element ids.
	pub(crate) fn collect_subtree(&self, roots: &[ObjectId], out: &mut Vec<ObjectId>) {
		let mut stack: Vec<ObjectId> = roots.iter().rev().copied().collect();
		while let Some(id) = stack.pop() {
			out.push(id);
			if let Some(element) = self.configuration_element(id) {
				stack.extend(element.children.iter().rev().copied());
			}
		}
	}

	/// Records a contribution, merging with an earlier one from the same contributor.
	pub fn add_contribution(&mut self, contribution: Contribution) {
		match self.contributions.get_mut(&contribution.contributor) {
			Some(existing) => existing.merge(&contribution),
			None => {
				self.contributions.insert(contribution.contributor, contribution);
			}
		}
		self.dirty = true;
	}

	pub fn remove_contribution(&mut self, contributor: ContributorId) -> Option<Contribution> {
		let removed = self.contributions.shift_remove(&contributor);
		if removed.is_some() {
			self.dirty = true;
		}
		removed
	}

	pub fn has_contribution(&self, contributor: ContributorId) -> bool {
		self.contributions.contains_key(&contributor)
	}

	pub fn contribution(&self, contributor: ContributorId) -> Option<&Contribution> {
		self.contributions.get(&contributor)
	}

	pub fn contributions(&self) -> impl Iterator<Item = &Contribution> + '_ {
		self.contributions.values()
	}

	/// Contributors whose contributions live in `namespace`, in insertion order.
	pub fn contributors_in(&self, namespace: &str) -> Vec<ContributorId> {
		self.contributions
			.values()
			.filter(|contribution| contribution.namespace == namespace)
			.map(|contribution| contribution.contributor)
			.collect()
	}

	/// Distinct namespaces with at least one contribution, in insertion order.
	pub fn namespaces(&self) -> Vec<String> {
		let mut seen = FxHashSet::default();
		self.contributions
			.values()
			.filter(|contribution| seen.insert(contribution.namespace.as_str()))
			.map(|contribution| contribution.namespace.clone())
			.collect()
	}

	/// All live extension point ids, in id order.
	pub fn extension_point_ids(&self) -> Vec<ObjectId> {
		self.slots
			.iter()
			.flatten()
			.filter(|object| object.kind() == ObjectKind::ExtensionPoint)
			.map(RegistryObject::id)
			.collect()
	}

	pub fn add_orphan(&mut self, point_id: &str, extension: ObjectId) {
		self.orphans.entry(point_id.to_owned()).or_default().push(extension);
		self.dirty = true;
	}

	pub fn add_orphans(&mut self, point_id: &str, extensions: &[ObjectId]) {
		if extensions.is_empty() {
			return;
		}
		self.orphans.entry(point_id.to_owned()).or_default().extend_from_slice(extensions);
		self.dirty = true;
	}

	/// Takes the whole orphan bucket for a point, if any.
	pub fn remove_orphans(&mut self, point_id: &str) -> Option<Vec<ObjectId>> {
		let bucket = self.orphans.remove(point_id)?;
		self.dirty = true;
		Some(bucket)
	}

	/// Drops one extension from its orphan bucket; empty buckets are removed.
	pub fn remove_orphan(&mut self, point_id: &str, extension: ObjectId) -> bool {
		let Some(bucket) = self.orphans.get_mut(point_id) else {
			return false;
		};
		let before = bucket.len();
		bucket.retain(|&id| id != extension);
		let removed = bucket.len() != before;
		if bucket.is_empty() {
			self.orphans.remove(point_id);
		}
		if removed {
			self.dirty = true;
		}
		removed
	}

	pub fn orphans_of(&self, point_id: &str) -> Option<&[ObjectId]> {
		self.orphans.get(point_id).map(Vec::as_slice)
	}

	pub fn orphan_count(&self) -> usize {
		self.orphans.values().map(Vec::len).sum()
	}

	pub fn is_dirty(&self) -> bool {
		self.dirty
	}

	pub(crate) fn mark_clean(&mut self) {
		self.dirty = false;
	}

	/// Number of live objects.
	pub fn len(&self) -> usize {
		self.slots.iter().filter(|slot| slot.is_some()).count()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Highest id handed out so far plus one.
	pub fn next_id(&self) -> u32 {
		self.slots.len() as u32
	}
}
