//! Per-transaction change tracking.
//!
//! # Role
//!
//! While a write holds the exclusive lock, the linker appends
//! [`ExtensionDelta`]s to the [`DeltaTracker`], grouped by the namespace of
//! the affected extension point. When the write ends the tracker is drained
//! into a [`DeltaMap`] and handed to the dispatcher.
//!
//! # Invariants
//!
//! - Nothing is recorded when no listener is registered: the tracker is told
//!   up front and never allocates a delta in that case.
//! - A [`RegistryDelta`] is append-only until drained.
//! - Objects touched by a delta are captured while still live, so a listener
//!   can inspect extensions that the same write removed. The capture is
//!   closed once the event has been dispatched.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::error::{RegistryError, Result};
use crate::handles::ObjectResolver;
use crate::objects::{ObjectId, ObjectKind, RegistryObject};

/// Whether an extension was linked or unlinked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeltaKind {
	Added,
	Removed,
}

/// One extension linked to or unlinked from one extension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtensionDelta {
	pub extension: ObjectId,
	pub extension_point: ObjectId,
	pub kind: DeltaKind,
}

/// All extension deltas of one transaction in one namespace.
#[derive(Debug)]
pub struct RegistryDelta {
	namespace: String,
	deltas: Vec<ExtensionDelta>,
	objects: Option<Arc<DeltaObjectManager>>,
}

impl RegistryDelta {
	fn new(namespace: String) -> Self {
		Self {
			namespace,
			deltas: Vec::new(),
			objects: None,
		}
	}

	pub fn namespace(&self) -> &str {
		&self.namespace
	}

	pub fn extension_deltas(&self) -> &[ExtensionDelta] {
		&self.deltas
	}

	pub fn len(&self) -> usize {
		self.deltas.len()
	}

	pub fn is_empty(&self) -> bool {
		self.deltas.is_empty()
	}

	/// Resolver over the objects this delta refers to.
	pub fn object_manager(&self) -> Option<&Arc<DeltaObjectManager>> {
		self.objects.as_ref()
	}

	pub(crate) fn push(&mut self, delta: ExtensionDelta) {
		self.deltas.push(delta);
	}

	/// Releases the captured objects. Idempotent.
	pub(crate) fn close(&self) {
		if let Some(objects) = &self.objects {
			objects.close();
		}
	}
}

/// Deltas of one transaction keyed by namespace, in first-touched order.
pub type DeltaMap = IndexMap<String, RegistryDelta>;

/// Accumulates the deltas of the write currently holding the lock.
#[derive(Debug, Default)]
pub struct DeltaTracker {
	recording: bool,
	deltas: DeltaMap,
	captured: FxHashMap<ObjectId, RegistryObject>,
}

impl DeltaTracker {
	pub fn new() -> Self {
		Self::default()
	}

	/// Starts a transaction. With `recording == false` every record call is a no-op.
	pub fn begin(&mut self, recording: bool) {
		self.recording = recording;
		self.deltas.clear();
		self.captured.clear();
	}

	pub fn is_recording(&self) -> bool {
		self.recording
	}

	/// Returns the in-progress delta for `namespace`, creating it if absent.
	pub fn delta(&mut self, namespace: &str) -> &mut RegistryDelta {
		if !self.deltas.contains_key(namespace) {
			self.deltas.insert(namespace.to_owned(), RegistryDelta::new(namespace.to_owned()));
		}
		&mut self.deltas[namespace]
	}

	/// Appends one extension delta under `namespace`.
	pub fn record(&mut self, namespace: &str, delta: ExtensionDelta) {
		if !self.recording {
			return;
		}
		self.delta(namespace).push(delta);
	}

	/// Keeps an object reachable from the event even if the write removes it.
	pub fn capture(&mut self, object: RegistryObject) {
		if self.recording {
			self.captured.insert(object.id(), object);
		}
	}

	/// Ends the transaction and hands out its deltas, all sharing one object capture.
	pub fn finish(&mut self, live: Arc<dyn ObjectResolver>) -> DeltaMap {
		let mut deltas = std::mem::take(&mut self.deltas);
		let captured = std::mem::take(&mut self.captured);
		self.recording = false;
		if deltas.is_empty() {
			return deltas;
		}
		let objects = Arc::new(DeltaObjectManager::new(captured, live));
		for delta in deltas.values_mut() {
			delta.objects = Some(objects.clone());
		}
		deltas
	}
}

/// Object view attached to the deltas of one transaction.
///
/// Looks in the captured objects first, then in the live store. Once
/// closed, every lookup fails with [`RegistryError::DeltaClosed`].
pub struct DeltaObjectManager {
	objects: RwLock<Option<FxHashMap<ObjectId, RegistryObject>>>,
	fallback: Arc<dyn ObjectResolver>,
}

impl DeltaObjectManager {
	pub(crate) fn new(objects: FxHashMap<ObjectId, RegistryObject>, fallback: Arc<dyn ObjectResolver>) -> Self {
		Self {
			objects: RwLock::new(Some(objects)),
			fallback,
		}
	}

	pub fn close(&self) {
		self.objects.write().take();
	}

	pub fn is_closed(&self) -> bool {
		self.objects.read().is_none()
	}
}

impl ObjectResolver for DeltaObjectManager {
	fn resolve(&self, id: ObjectId, kind: ObjectKind) -> Result<RegistryObject> {
		{
			let guard = self.objects.read();
			let Some(objects) = guard.as_ref() else {
				return Err(RegistryError::DeltaClosed);
			};
			if let Some(object) = objects.get(&id) {
				return if object.kind() == kind {
					Ok(object.clone())
				} else {
					Err(RegistryError::NotFound { id, kind })
				};
			}
		}
		self.fallback.resolve(id, kind)
	}
}

impl std::fmt::Debug for DeltaObjectManager {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let guard = self.objects.read();
		f.debug_struct("DeltaObjectManager")
			.field("closed", &guard.is_none())
			.field("captured", &guard.as_ref().map_or(0, |objects| objects.len()))
			.finish()
	}
}
