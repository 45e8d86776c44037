//! Extension registry: extension points, the extensions plugged into them,
//! and change notification.
//!
//! Contributors declare extension points and extensions. The registry links
//! each extension to the point it targets, parking it as an orphan until that
//! point exists, and reports every link and unlink to registered listeners on
//! a dedicated dispatcher thread. The whole store can be cached to disk and
//! reloaded at the next open.
//!
//! # Modules
//!
//! - [`objects`] - Object arena, ids and the registry object types
//! - `linker` (crate-private) - Extension ↔ extension point resolution
//! - [`delta`] - Per-write change tracking
//! - [`events`] - Listeners and change events
//! - [`dispatch`] - Background event delivery
//! - [`cache`] - On-disk cache
//! - [`registry`] - The [`ExtensionRegistry`] facade
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use plexus_registry::{
//! 	ContributorId, Declaration, ExtensionDecl, ExtensionPointDecl, ExtensionRegistry, NamespaceTable, RegistryConfig,
//! };
//!
//! let strategy = NamespaceTable::new()
//! 	.with_namespace(ContributorId(1), "A")
//! 	.with_namespace(ContributorId(2), "B");
//! let registry = ExtensionRegistry::open(RegistryConfig::default(), Arc::new(strategy));
//!
//! registry.add(Declaration::new(ContributorId(2)).with_extension(ExtensionDecl::new("A.widgets").with_id("red")))?;
//! registry.add(Declaration::new(ContributorId(1)).with_extension_point(ExtensionPointDecl::new("widgets")))?;
//!
//! let point = registry.extension_point("A.widgets").unwrap();
//! assert_eq!(point.extensions()?[0].unique_identifier()?.as_deref(), Some("B.red"));
//! registry.stop(None)?;
//! # Ok::<(), plexus_registry::RegistryError>(())
//! ```

pub mod cache;
pub mod config;
pub mod declaration;
pub mod delta;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod handles;
mod linker;
pub mod objects;
pub mod registry;
pub mod strategy;

pub use cache::CacheStore;
pub use config::RegistryConfig;
pub use declaration::{
	Declaration, DeclarationParser, ExtensionDecl, ExtensionDescription, ExtensionPointDecl, ParseReport,
};
pub use delta::{DeltaKind, ExtensionDelta, RegistryDelta};
pub use error::{CacheError, RegistryError, Result};
pub use events::{
	DispatchStatus, ExtensionDeltaView, ListenerFailure, ListenerInfo, RegistryChangeEvent, RegistryChangeListener,
};
pub use handles::{ConfigurationElementHandle, ElementParent, ExtensionHandle, ExtensionPointHandle};
pub use objects::{ContributorId, ObjectId, ObjectKind};
pub use registry::{AccessToken, ExtensionRegistry};
pub use strategy::{NamespaceTable, RegistryStrategy};
