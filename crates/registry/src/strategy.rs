//! Host hooks the registry calls out to.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::objects::ContributorId;
use crate::registry::ExtensionRegistry;

/// Host-specific behavior of a registry.
pub trait RegistryStrategy: Send + Sync {
	/// Namespace of a contributor. `None` marks it anonymous; its
	/// contributions are ignored.
	fn namespace(&self, contributor: ContributorId) -> Option<String>;

	/// Contributor that owns the namespace `contributor` contributes to.
	fn namespace_owner(&self, contributor: ContributorId) -> ContributorId {
		contributor
	}

	/// Fingerprint of the host state the cache was built from. A cache with
	/// another fingerprint is discarded at open.
	fn cache_fingerprint(&self) -> u64 {
		0
	}

	/// Translates labels and property values of programmatically created objects.
	fn translate(&self, value: &str) -> String {
		value.to_owned()
	}

	/// Called once the registry is open.
	fn on_start(&self, _registry: &ExtensionRegistry) {}

	/// Called at the start of [`ExtensionRegistry::stop`].
	fn on_stop(&self, _registry: &ExtensionRegistry) {}
}

/// Contributor → namespace table with a fixed fingerprint.
#[derive(Debug, Default)]
pub struct NamespaceTable {
	namespaces: RwLock<FxHashMap<ContributorId, String>>,
	fingerprint: u64,
}

impl NamespaceTable {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_fingerprint(mut self, fingerprint: u64) -> Self {
		self.fingerprint = fingerprint;
		self
	}

	pub fn with_namespace(self, contributor: ContributorId, namespace: impl Into<String>) -> Self {
		self.register(contributor, namespace);
		self
	}

	pub fn register(&self, contributor: ContributorId, namespace: impl Into<String>) {
		self.namespaces.write().insert(contributor, namespace.into());
	}

	pub fn unregister(&self, contributor: ContributorId) -> Option<String> {
		self.namespaces.write().remove(&contributor)
	}
}

impl RegistryStrategy for NamespaceTable {
	fn namespace(&self, contributor: ContributorId) -> Option<String> {
		self.namespaces.read().get(&contributor).cloned()
	}

	fn cache_fingerprint(&self) -> u64 {
		self.fingerprint
	}
}
