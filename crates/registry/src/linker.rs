//! Extension ↔ extension point resolution.
//!
//! # Role
//!
//! Links extensions into the child list of the point they target, parking
//! them in the orphan table while that point does not exist, and records
//! the resulting deltas.
//!
//! # Invariants
//!
//! - Every extension is either in its live point's child list or in exactly
//!   one orphan bucket, never both.
//!   - Enforced in: [`Linker::link_extension`], [`Linker::link_extension_point`],
//!     [`Linker::unlink_extension_point`].
//!   - Tested by: `linker::tests::orphan_order_is_irrelevant`.
//! - A point's child list has no duplicates and is replaced wholesale, never
//!   edited in place.
//! - Orphan parking and unparking of an orphan is not observable and records
//!   no delta; linking records `Added`, unlinking records `Removed`, both
//!   under the point's namespace.

use std::sync::Arc;

use rustc_hash::FxHashSet;

use crate::delta::{DeltaKind, DeltaTracker, ExtensionDelta};
use crate::objects::{ContributorId, ExtensionPoint, ObjectId, ObjectKind, ObjectManager, RegistryObject};

/// Mutable view over the store and the delta tracker for one write.
pub(crate) struct Linker<'a> {
	objects: &'a mut ObjectManager,
	deltas: &'a mut DeltaTracker,
}

impl<'a> Linker<'a> {
	pub fn new(objects: &'a mut ObjectManager, deltas: &'a mut DeltaTracker) -> Self {
		Self { objects, deltas }
	}

	/// Links newly stored points, then newly stored extensions. Returns affected namespaces.
	pub fn link_all(&mut self, points: &[ObjectId], extensions: &[ObjectId]) -> FxHashSet<String> {
		let mut affected = FxHashSet::default();
		for &point in points {
			affected.extend(self.link_extension_point(point));
		}
		for &extension in extensions {
			affected.extend(self.link_extension(extension));
		}
		affected
	}

	/// Unlinks a contributor's extensions, then its points. Returns affected namespaces.
	pub fn unlink_contributor(&mut self, contributor: ContributorId) -> FxHashSet<String> {
		let mut affected = FxHashSet::default();
		for extension in self.objects.objects_from(contributor, ObjectKind::Extension) {
			affected.extend(self.unlink_extension(extension));
		}
		for point in self.objects.objects_from(contributor, ObjectKind::ExtensionPoint) {
			affected.extend(self.unlink_extension_point(point));
		}
		affected
	}

	/// Attaches an extension to its target point, or parks it as an orphan.
	pub fn link_extension(&mut self, id: ObjectId) -> Option<String> {
		let extension = self.objects.extension(id)?.clone();
		let Some(point) = self.objects.point_by_unique_id(&extension.point_id).cloned() else {
			tracing::trace!(extension = %id, point = %extension.point_id, "extension parked as orphan");
			self.objects.add_orphan(&extension.point_id, id);
			return None;
		};
		if point.children.contains(&id) {
			return None;
		}
		let children: Arc<[ObjectId]> = point.children.iter().copied().chain(std::iter::once(id)).collect();
		let point = self.objects.set_point_children(point.id, children)?;
		tracing::trace!(extension = %id, point = %point.unique_id, "extension linked");
		self.record(&point, &[id], DeltaKind::Added)
	}

	/// Adopts every orphan that was waiting for this point.
	pub fn link_extension_point(&mut self, id: ObjectId) -> Option<String> {
		let point = self.objects.extension_point(id)?.clone();
		let mut orphans = self.objects.remove_orphans(&point.unique_id)?;
		let mut seen = FxHashSet::default();
		orphans.retain(|orphan| seen.insert(*orphan));
		let point = self.objects.set_point_children(id, Arc::from(orphans.as_slice()))?;
		tracing::trace!(point = %point.unique_id, adopted = orphans.len(), "orphans linked to extension point");
		self.record(&point, &orphans, DeltaKind::Added)
	}

	/// Detaches an extension from its point, or drops it from its orphan bucket.
	pub fn unlink_extension(&mut self, id: ObjectId) -> Option<String> {
		let extension = self.objects.extension(id)?.clone();
		let linked = self
			.objects
			.point_by_unique_id(&extension.point_id)
			.filter(|point| point.children.contains(&id))
			.cloned();
		let Some(point) = linked else {
			self.objects.remove_orphan(&extension.point_id, id);
			return None;
		};
		let children: Arc<[ObjectId]> = point.children.iter().copied().filter(|&child| child != id).collect();
		let point = self.objects.set_point_children(point.id, children)?;
		tracing::trace!(extension = %id, point = %point.unique_id, "extension unlinked");
		self.record(&point, &[id], DeltaKind::Removed)
	}

	/// Moves a point's children into a fresh orphan bucket so they survive
	/// its removal and relink when a point with the same id reappears.
	pub fn unlink_extension_point(&mut self, id: ObjectId) -> Option<String> {
		let point = self.objects.extension_point(id)?.clone();
		if point.children.is_empty() {
			return None;
		}
		let children = point.children.clone();
		self.objects.add_orphans(&point.unique_id, &children);
		let point = self.objects.set_point_children(id, Arc::from([]))?;
		tracing::trace!(point = %point.unique_id, orphaned = children.len(), "extension point unlinked");
		self.record(&point, &children, DeltaKind::Removed)
	}

	fn record(&mut self, point: &Arc<ExtensionPoint>, extensions: &[ObjectId], kind: DeltaKind) -> Option<String> {
		if !self.deltas.is_recording() || extensions.is_empty() {
			return None;
		}
		self.deltas.capture(RegistryObject::ExtensionPoint(point.clone()));
		for &extension in extensions {
			capture_extension(&*self.objects, &mut *self.deltas, extension);
			self.deltas.record(
				&point.namespace,
				ExtensionDelta {
					extension,
					extension_point: point.id,
					kind,
				},
			);
		}
		Some(point.namespace.clone())
	}
}

fn capture_extension(objects: &ObjectManager, deltas: &mut DeltaTracker, id: ObjectId) {
	let Some(object) = objects.object(id) else {
		return;
	};
	let mut subtree = Vec::new();
	objects.collect_subtree(object.children(), &mut subtree);
	deltas.capture(object.clone());
	for element in subtree {
		if let Some(object) = objects.object(element) {
			deltas.capture(object.clone());
		}
	}
}
