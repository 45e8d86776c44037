//! The registry facade.
//!
//! # Role
//!
//! [`ExtensionRegistry`] composes the object store, the linker, the delta
//! tracker, the dispatcher and the cache behind one readers-writer lock.
//!
//! # Invariants
//!
//! - A write holds the exclusive lock from the first store mutation until its
//!   deltas are drained, and schedules the event after releasing it.
//! - A read holds the shared lock only for the lookup itself. Handles resolve
//!   lazily and never keep a lock between calls.
//! - No listener runs and no file is touched while the lock is held.
//!   - Enforced in: `ExtensionRegistry::transact`, [`ExtensionRegistry::stop`].
//! - Deltas are only recorded when at least one listener was registered at
//!   the start of the write.
//! - After [`ExtensionRegistry::stop`] every write fails with
//!   [`RegistryError::Stopped`]. The stop flag is set under the write lock,
//!   so every write that returned `Ok` is part of the final flush.
//!   - Tested by: `registry::tests::write_racing_stop_is_flushed_or_rejected`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};

use crate::cache::CacheStore;
use crate::cache::format;
use crate::config::RegistryConfig;
use crate::declaration::{Declaration, DeclarationParser, ExtensionDecl, ExtensionDescription, ExtensionPointDecl};
use crate::delta::{DeltaMap, DeltaTracker};
use crate::dispatch::ChangeDispatcher;
use crate::error::{RegistryError, Result};
use crate::events::{EventLogger, ListenerInfo, RegistryChangeListener};
use crate::handles::{ConfigurationElementHandle, ExtensionHandle, ExtensionPointHandle, ObjectResolver};
use crate::linker::Linker;
use crate::objects::{
	ConfigurationElement, Contribution, ContributorId, Extension, ExtensionPoint, ObjectId, ObjectKind, ObjectManager,
	ParentKind, RegistryObject, qualify,
};
use crate::strategy::RegistryStrategy;

/// Capability required for administrative operations.
///
/// Tokens compare by identity: two tokens are equal only if one is a clone of
/// the other.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccessToken(u64);

impl AccessToken {
	pub fn new() -> Self {
		static NEXT: AtomicU64 = AtomicU64::new(1);
		Self(NEXT.fetch_add(1, Ordering::Relaxed))
	}
}

impl Default for AccessToken {
	fn default() -> Self {
		Self::new()
	}
}

/// State guarded by the registry lock.
#[derive(Debug, Default)]
struct RegistryState {
	objects: ObjectManager,
	deltas: DeltaTracker,
}

/// Resolver over the live store, handed to handles produced by lookups.
struct LiveObjects {
	state: Arc<RwLock<RegistryState>>,
}

impl ObjectResolver for LiveObjects {
	fn resolve(&self, id: ObjectId, kind: ObjectKind) -> Result<RegistryObject> {
		self.state.read().objects.get(id, kind).cloned()
	}
}

/// A declaration whose contributor-dependent values were resolved before
/// taking the lock.
struct Prepared {
	declaration: Declaration,
	namespace: String,
	owner: ContributorId,
}

/// What one declaration added.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Ingested {
	points: usize,
	extensions: usize,
}

/// The extension registry.
pub struct ExtensionRegistry {
	state: Arc<RwLock<RegistryState>>,
	live: Arc<dyn ObjectResolver>,
	listeners: ArcSwap<Vec<ListenerInfo>>,
	dispatcher: ChangeDispatcher,
	strategy: Arc<dyn RegistryStrategy>,
	config: RegistryConfig,
	cache: Mutex<Option<CacheStore>>,
	token: Option<AccessToken>,
	filled_from_cache: bool,
	stopped: AtomicBool,
}

impl ExtensionRegistry {
	/// Opens a registry without an access token.
	pub fn open(config: RegistryConfig, strategy: Arc<dyn RegistryStrategy>) -> Self {
		Self::open_inner(config, strategy, None)
	}

	/// Opens a registry whose administrative operations require `token`.
	pub fn open_with_token(config: RegistryConfig, strategy: Arc<dyn RegistryStrategy>, token: AccessToken) -> Self {
		Self::open_inner(config, strategy, Some(token))
	}

	fn open_inner(config: RegistryConfig, strategy: Arc<dyn RegistryStrategy>, token: Option<AccessToken>) -> Self {
		let cache = CacheStore::from_config(&config);
		let mut objects = None;
		if config.use_cache
			&& let Some(cache) = &cache
		{
			let started = Instant::now();
			match cache.load(strategy.cache_fingerprint()) {
				Ok(store) => objects = Some(store),
				Err(error) => tracing::debug!(error = %error, "registry cache unusable; starting cold"),
			}
			if config.debug {
				tracing::debug!(
					elapsed_ms = started.elapsed().as_millis() as u64,
					hit = objects.is_some(),
					"registry cache load"
				);
			}
		}
		let filled_from_cache = objects.is_some();
		let state = Arc::new(RwLock::new(RegistryState {
			objects: objects.unwrap_or_default(),
			deltas: DeltaTracker::new(),
		}));
		let live: Arc<dyn ObjectResolver> = Arc::new(LiveObjects { state: state.clone() });

		let registry = Self {
			state,
			live,
			listeners: ArcSwap::from_pointee(Vec::new()),
			dispatcher: ChangeDispatcher::new(),
			strategy,
			cache: Mutex::new(cache),
			token,
			filled_from_cache,
			stopped: AtomicBool::new(false),
			config,
		};
		if registry.config.debug_events {
			registry.add_listener(Arc::new(EventLogger), None);
		}
		registry.strategy.on_start(&registry);
		tracing::debug!(filled_from_cache, "extension registry opened");
		registry
	}

	pub fn config(&self) -> &RegistryConfig {
		&self.config
	}

	/// Whether open rehydrated the store from the cache.
	pub fn filled_from_cache(&self) -> bool {
		self.filled_from_cache
	}

	/// Whether the store changed since it was opened or last flushed.
	pub fn is_dirty(&self) -> bool {
		self.state.read().objects.is_dirty()
	}

	pub fn is_stopped(&self) -> bool {
		self.stopped.load(Ordering::Acquire)
	}

	fn check_token(&self, token: Option<&AccessToken>, operation: &'static str) -> Result<()> {
		match &self.token {
			Some(expected) if token != Some(expected) => Err(RegistryError::Unauthorized { operation }),
			_ => Ok(()),
		}
	}

	/// Programmatic ingestion is open to anyone on a modifiable registry and
	/// needs the owner's token otherwise.
	fn check_write_access(&self, token: Option<&AccessToken>, operation: &'static str) -> Result<()> {
		if self.config.modifiable {
			return Ok(());
		}
		match &self.token {
			Some(expected) if token == Some(expected) => Ok(()),
			_ => Err(RegistryError::Unauthorized { operation }),
		}
	}

	fn prepare(&self, declaration: Declaration) -> Option<Prepared> {
		let contributor = declaration.contributor;
		let Some(namespace) = self.strategy.namespace(contributor) else {
			tracing::debug!(%contributor, "contribution from anonymous contributor ignored");
			return None;
		};
		Some(Prepared {
			owner: self.strategy.namespace_owner(contributor),
			namespace,
			declaration,
		})
	}

	/// Runs one write under the exclusive lock, then schedules its deltas.
	fn transact<R>(&self, write: impl FnOnce(&mut RegistryState) -> R) -> Result<R> {
		if self.is_stopped() {
			return Err(RegistryError::Stopped);
		}
		let listeners = self.listeners.load_full();
		let (result, deltas) = {
			let mut state = self.state.write();
			// stop sets the flag under this lock; a write admitted above may
			// otherwise commit after the flush and never reach the cache.
			if self.is_stopped() {
				return Err(RegistryError::Stopped);
			}
			state.deltas.begin(!listeners.is_empty());
			let result = write(&mut *state);
			let deltas = state.deltas.finish(self.live.clone());
			(result, deltas)
		};
		// Events are delivered in schedule order. Writers on different threads
		// schedule after unlocking, so that order can differ from commit order.
		self.fire(listeners, deltas);
		Ok(result)
	}

	fn fire(&self, listeners: Arc<Vec<ListenerInfo>>, deltas: DeltaMap) {
		if deltas.is_empty() {
			return;
		}
		if listeners.is_empty() {
			for delta in deltas.values() {
				delta.close();
			}
			return;
		}
		self.dispatcher.schedule(listeners, deltas);
	}

	/// Adds one contributor's declaration and links it.
	pub fn add(&self, declaration: Declaration) -> Result<()> {
		self.add_all(vec![declaration])
	}

	/// Adds several declarations in one write; listeners see one event.
	pub fn add_all(&self, declarations: Vec<Declaration>) -> Result<()> {
		let prepared: Vec<Prepared> = declarations.into_iter().filter_map(|decl| self.prepare(decl)).collect();
		if prepared.is_empty() {
			return Ok(());
		}
		self.transact(|state| {
			for prepared in prepared {
				state.ingest(prepared);
			}
		})
	}

	/// Unlinks and purges everything a contributor owns. Returns whether it was known.
	pub fn remove(&self, contributor: ContributorId) -> Result<bool> {
		self.transact(|state| state.remove_contributor(contributor))
	}

	/// Parses `source` with `parser` and adds the result.
	///
	/// Returns `Ok(false)` when the parser reported problems; each is logged
	/// and nothing is added.
	pub fn add_from_source(
		&self,
		parser: &dyn DeclarationParser,
		contributor: ContributorId,
		source: &[u8],
		source_name: &str,
		token: Option<&AccessToken>,
	) -> Result<bool> {
		self.check_write_access(token, "add_from_source")?;
		match parser.parse(contributor, source, source_name) {
			Ok(declaration) => {
				self.add(declaration)?;
				Ok(true)
			}
			Err(report) => {
				for problem in &report.problems {
					tracing::error!(%contributor, source = source_name, problem = %problem, "malformed declaration");
				}
				Ok(false)
			}
		}
	}

	/// Creates one extension point. Returns `Ok(false)` if the id is taken or
	/// the contributor is anonymous.
	pub fn create_extension_point(
		&self,
		contributor: ContributorId,
		local_id: &str,
		label: &str,
		schema: Option<&str>,
		token: Option<&AccessToken>,
	) -> Result<bool> {
		self.check_write_access(token, "create_extension_point")?;
		if local_id.is_empty() {
			return Err(RegistryError::MissingArgument("extension point identifier"));
		}
		let mut point = ExtensionPointDecl::new(local_id).with_label(self.strategy.translate(label));
		point.schema = schema.map(str::to_owned);
		let Some(prepared) = self.prepare(Declaration::new(contributor).with_extension_point(point)) else {
			return Ok(false);
		};
		let ingested = self.transact(|state| state.ingest(prepared))?;
		Ok(ingested.points == 1)
	}

	/// Creates one extension with its content tree. Returns `Ok(false)` if the
	/// contributor is anonymous.
	pub fn create_extension(
		&self,
		contributor: ContributorId,
		local_id: Option<&str>,
		label: &str,
		target: &str,
		content: Vec<ExtensionDescription>,
		token: Option<&AccessToken>,
	) -> Result<bool> {
		self.check_write_access(token, "create_extension")?;
		if target.is_empty() {
			return Err(RegistryError::MissingArgument("extension point identifier"));
		}
		let extension = ExtensionDecl {
			local_id: local_id.map(str::to_owned),
			label: self.strategy.translate(label),
			target: target.to_owned(),
			content: content.iter().map(|element| self.translate_tree(element)).collect(),
		};
		let Some(prepared) = self.prepare(Declaration::new(contributor).with_extension(extension)) else {
			return Ok(false);
		};
		let ingested = self.transact(|state| state.ingest(prepared))?;
		Ok(ingested.extensions == 1)
	}

	fn translate_tree(&self, element: &ExtensionDescription) -> ExtensionDescription {
		ExtensionDescription {
			name: element.name.clone(),
			properties: element
				.properties
				.iter()
				.map(|(key, value)| (key.clone(), self.strategy.translate(value)))
				.collect(),
			value: element.value.clone(),
			children: element.children.iter().map(|child| self.translate_tree(child)).collect(),
		}
	}

	fn point_handle(&self, id: ObjectId) -> ExtensionPointHandle {
		ExtensionPointHandle::new(self.live.clone(), id)
	}

	fn extension_handle(&self, id: ObjectId) -> ExtensionHandle {
		ExtensionHandle::new(self.live.clone(), id)
	}

	fn element_handles(&self, ids: &[ObjectId]) -> Vec<ConfigurationElementHandle> {
		ids.iter()
			.map(|&id| ConfigurationElementHandle::new(self.live.clone(), id))
			.collect()
	}

	/// Looks up an extension point by its fully-qualified id.
	pub fn extension_point(&self, unique_id: &str) -> Option<ExtensionPointHandle> {
		let state = self.state.read();
		let id = state.objects.point_by_unique_id(unique_id)?.id;
		drop(state);
		Some(self.point_handle(id))
	}

	pub fn extension_point_in(&self, namespace: &str, local_id: &str) -> Option<ExtensionPointHandle> {
		self.extension_point(&qualify(namespace, local_id))
	}

	/// Every live extension point, in creation order.
	pub fn extension_points(&self) -> Vec<ExtensionPointHandle> {
		let ids = self.state.read().objects.extension_point_ids();
		ids.into_iter().map(|id| self.point_handle(id)).collect()
	}

	/// Extension points declared by contributors of `namespace`.
	pub fn extension_points_in(&self, namespace: &str) -> Vec<ExtensionPointHandle> {
		let ids: Vec<ObjectId> = {
			let state = self.state.read();
			state
				.objects
				.contributors_in(namespace)
				.into_iter()
				.filter_map(|contributor| state.objects.contribution(contributor))
				.flat_map(|contribution| contribution.extension_points())
				.filter(|&id| state.objects.extension_point(id).is_some())
				.collect()
		};
		ids.into_iter().map(|id| self.point_handle(id)).collect()
	}

	/// Looks up a linked extension by its fully-qualified id.
	pub fn extension(&self, unique_id: &str) -> Option<ExtensionHandle> {
		let (namespace, _) = crate::objects::split_qualified(unique_id)?;
		let id = {
			let state = self.state.read();
			state.linked_extensions_in(namespace).into_iter().find(|&id| {
				state
					.objects
					.extension(id)
					.is_some_and(|extension| extension.unique_id().as_deref() == Some(unique_id))
			})?
		};
		Some(self.extension_handle(id))
	}

	/// Finds an extension linked to the point `point_id` by its fully-qualified id.
	pub fn extension_for_point(&self, point_id: &str, extension_id: &str) -> Option<ExtensionHandle> {
		let id = {
			let state = self.state.read();
			let point = state.objects.point_by_unique_id(point_id)?;
			point.children.iter().copied().find(|&id| {
				state
					.objects
					.extension(id)
					.is_some_and(|extension| extension.unique_id().as_deref() == Some(extension_id))
			})?
		};
		Some(self.extension_handle(id))
	}

	pub fn extension_in(&self, namespace: &str, point_local_id: &str, extension_id: &str) -> Option<ExtensionHandle> {
		self.extension_for_point(&qualify(namespace, point_local_id), extension_id)
	}

	/// Linked extensions declared by contributors of `namespace`.
	pub fn extensions_in(&self, namespace: &str) -> Vec<ExtensionHandle> {
		let ids = self.state.read().linked_extensions_in(namespace);
		ids.into_iter().map(|id| self.extension_handle(id)).collect()
	}

	/// Top-level configuration elements of every extension linked to `point_id`.
	pub fn configuration_elements_for(&self, point_id: &str) -> Vec<ConfigurationElementHandle> {
		let ids: Vec<ObjectId> = {
			let state = self.state.read();
			let Some(point) = state.objects.point_by_unique_id(point_id) else {
				return Vec::new();
			};
			point
				.children
				.iter()
				.filter_map(|&id| state.objects.extension(id))
				.flat_map(|extension| extension.children.iter().copied())
				.collect()
		};
		self.element_handles(&ids)
	}

	pub fn configuration_elements_in(&self, namespace: &str, point_local_id: &str) -> Vec<ConfigurationElementHandle> {
		self.configuration_elements_for(&qualify(namespace, point_local_id))
	}

	/// Top-level configuration elements of one linked extension.
	pub fn configuration_elements_for_extension(
		&self,
		namespace: &str,
		point_local_id: &str,
		extension_id: &str,
	) -> Vec<ConfigurationElementHandle> {
		let Some(extension) = self.extension_in(namespace, point_local_id, extension_id) else {
			return Vec::new();
		};
		let ids = {
			let state = self.state.read();
			match state.objects.extension(extension.id()) {
				Some(extension) => extension.children.to_vec(),
				None => return Vec::new(),
			}
		};
		self.element_handles(&ids)
	}

	/// Distinct namespaces with at least one contribution.
	pub fn namespaces(&self) -> Vec<String> {
		self.state.read().objects.namespaces()
	}

	pub fn has_contributor(&self, contributor: ContributorId) -> bool {
		self.state.read().objects.has_contribution(contributor)
	}

	/// Registers a listener. A listener already registered keeps its filter.
	pub fn add_listener(&self, listener: Arc<dyn RegistryChangeListener>, filter: Option<&str>) {
		let filter = filter.map(str::to_owned);
		self.listeners.rcu(|current| {
			let mut next = Vec::clone(current);
			if !next.iter().any(|info| info.is_listener(&listener)) {
				next.push(ListenerInfo::new(listener.clone(), filter.clone()));
			}
			next
		});
	}

	pub fn remove_listener(&self, listener: &Arc<dyn RegistryChangeListener>) {
		self.listeners.rcu(|current| {
			current
				.iter()
				.filter(|info| !info.is_listener(listener))
				.cloned()
				.collect::<Vec<_>>()
		});
	}

	pub fn listener_count(&self) -> usize {
		self.listeners.load().len()
	}

	/// Stops the dispatcher and flushes the store to the cache if it changed.
	///
	/// Events still queued are dropped. A cache write failure is logged and
	/// leaves the previously published cache in place. Calling stop again is
	/// a no-op.
	pub fn stop(&self, token: Option<&AccessToken>) -> Result<()> {
		self.check_token(token, "stop")?;
		{
			let _state = self.state.write();
			if self.stopped.swap(true, Ordering::AcqRel) {
				return Ok(());
			}
		}
		self.strategy.on_stop(self);
		self.dispatcher.stop();
		self.flush();
		tracing::debug!("extension registry stopped");
		Ok(())
	}

	fn flush(&self) {
		let cache = self.cache.lock().take();
		let Some(cache) = cache else {
			return;
		};
		if !cache.is_writable() {
			tracing::debug!("registry cache location is not writable; skipping flush");
			return;
		}
		let started = Instant::now();
		let encoded = {
			let state = self.state.read();
			if !state.objects.is_dirty() {
				return;
			}
			format::encode(&state.objects.to_parts(), self.strategy.cache_fingerprint())
		};
		let outcome = encoded.and_then(|encoded| cache.store(&encoded));
		match outcome {
			Ok(generation) => {
				self.state.write().objects.mark_clean();
				if self.config.debug {
					tracing::debug!(
						generation,
						elapsed_ms = started.elapsed().as_millis() as u64,
						"registry cache store"
					);
				}
			}
			Err(error) => tracing::warn!(error = %error, "failed to write registry cache"),
		}
	}

	/// Removes the published cache so the next open starts cold.
	///
	/// Returns false when there is no writable cache location or removal failed.
	pub fn clear_cache(&self) -> bool {
		let cache = self.cache.lock();
		let Some(cache) = cache.as_ref() else {
			return false;
		};
		match cache.clear() {
			Ok(()) => true,
			Err(error) => {
				tracing::warn!(error = %error, "failed to clear registry cache");
				false
			}
		}
	}
}

impl std::fmt::Debug for ExtensionRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ExtensionRegistry")
			.field("listeners", &self.listener_count())
			.field("filled_from_cache", &self.filled_from_cache)
			.field("stopped", &self.is_stopped())
			.finish_non_exhaustive()
	}
}

impl RegistryState {
	/// Stores one declaration's objects and links them.
	fn ingest(&mut self, prepared: Prepared) -> Ingested {
		let Prepared {
			declaration,
			namespace,
			owner,
		} = prepared;
		let contributor = declaration.contributor;
		let objects = &mut self.objects;

		let mut points = Vec::with_capacity(declaration.extension_points.len());
		for decl in declaration.extension_points {
			let unique_id = qualify(&namespace, &decl.local_id);
			if objects.point_by_unique_id(&unique_id).is_some() {
				tracing::warn!(%contributor, point = %unique_id, "duplicate extension point ignored");
				continue;
			}
			let id = objects.allocate_id();
			let point = ExtensionPoint {
				id,
				unique_id,
				label: decl.label,
				schema: decl.schema,
				namespace: namespace.clone(),
				namespace_owner: owner,
				contributor,
				children: Arc::from([]),
			};
			points.push(objects.add(RegistryObject::ExtensionPoint(Arc::new(point)), true));
		}

		let mut extensions = Vec::with_capacity(declaration.extensions.len());
		for decl in declaration.extensions {
			let point_id = if decl.target.contains('.') {
				decl.target
			} else {
				qualify(&namespace, &decl.target)
			};
			let id = objects.allocate_id();
			let children = add_elements(objects, &decl.content, id, ParentKind::Extension, owner, contributor);
			let extension = Extension {
				id,
				simple_id: decl.local_id,
				label: decl.label,
				point_id,
				namespace: namespace.clone(),
				contributor,
				children: children.into(),
			};
			extensions.push(objects.add(RegistryObject::Extension(Arc::new(extension)), false));
		}

		objects.add_contribution(Contribution::new(contributor, namespace, &points, &extensions));
		let affected = Linker::new(&mut self.objects, &mut self.deltas).link_all(&points, &extensions);
		tracing::trace!(
			%contributor,
			points = points.len(),
			extensions = extensions.len(),
			namespaces = affected.len(),
			"contribution added"
		);
		Ingested {
			points: points.len(),
			extensions: extensions.len(),
		}
	}

	/// Unlinks a contributor's extensions and points, then purges its objects
	/// and finally its contribution record.
	fn remove_contributor(&mut self, contributor: ContributorId) -> bool {
		if !self.objects.has_contribution(contributor) {
			return false;
		}
		let affected = Linker::new(&mut self.objects, &mut self.deltas).unlink_contributor(contributor);
		let owned = self.objects.associated_objects(contributor);
		let removed = self.objects.remove(&owned);
		self.objects.remove_contribution(contributor);
		tracing::trace!(%contributor, removed = removed.len(), namespaces = affected.len(), "contribution removed");
		true
	}

	/// Extensions of `namespace` currently linked to a live point.
	fn linked_extensions_in(&self, namespace: &str) -> Vec<ObjectId> {
		let objects = &self.objects;
		objects
			.contributors_in(namespace)
			.into_iter()
			.filter_map(|contributor| objects.contribution(contributor))
			.flat_map(|contribution| contribution.extensions())
			.filter(|&id| {
				objects.extension(id).is_some_and(|extension| {
					objects
						.point_by_unique_id(&extension.point_id)
						.is_some_and(|point| point.children.contains(&id))
				})
			})
			.collect()
	}
}

/// Stores a content tree depth-first and returns the ids of its roots.
fn add_elements(
	objects: &mut ObjectManager,
	elements: &[ExtensionDescription],
	parent: ObjectId,
	parent_kind: ParentKind,
	owner: ContributorId,
	contributor: ContributorId,
) -> Vec<ObjectId> {
	let mut ids = Vec::with_capacity(elements.len());
	for element in elements {
		let id = objects.allocate_id();
		let children = add_elements(
			objects,
			&element.children,
			id,
			ParentKind::ConfigurationElement,
			owner,
			contributor,
		);
		let properties = element
			.properties
			.iter()
			.flat_map(|(key, value)| [key.clone(), value.clone()])
			.collect();
		let element = ConfigurationElement {
			id,
			name: element.name.clone(),
			properties,
			value: element.value.clone(),
			parent,
			parent_kind,
			namespace_owner: owner,
			contributor,
			children: children.into(),
		};
		ids.push(objects.add(RegistryObject::ConfigurationElement(Arc::new(element)), false));
	}
	ids
}

#[cfg(test)]
mod tests;
