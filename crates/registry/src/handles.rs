//! Read handles over registry objects.
//!
//! # Role
//!
//! A handle is an [`ObjectId`] plus the [`ObjectResolver`] it was produced
//! by. Handles handed out by registry lookups resolve against the live store
//! (taking the shared lock per call); handles reached through a change event
//! resolve against that event's delta objects first.
//!
//! # Invariants
//!
//! - A handle never holds a lock between calls.
//! - Resolving a removed object yields [`RegistryError::InvalidObject`].

use std::fmt;
use std::sync::Arc;

use crate::error::{RegistryError, Result};
use crate::objects::{
	ConfigurationElement, ContributorId, Extension, ExtensionPoint, ObjectId, ObjectKind, ParentKind, RegistryObject,
};

/// Capability to look objects up by id.
pub trait ObjectResolver: Send + Sync {
	/// Returns the object with this id and kind.
	fn resolve(&self, id: ObjectId, kind: ObjectKind) -> Result<RegistryObject>;
}

fn resolve_as<T>(
	resolver: &dyn ObjectResolver,
	id: ObjectId,
	kind: ObjectKind,
	project: impl FnOnce(RegistryObject) -> Option<Arc<T>>,
) -> Result<Arc<T>> {
	match resolver.resolve(id, kind) {
		Ok(object) => project(object).ok_or(RegistryError::InvalidObject { id }),
		Err(RegistryError::NotFound { .. }) => Err(RegistryError::InvalidObject { id }),
		Err(other) => Err(other),
	}
}

/// Handle to an extension point.
#[derive(Clone)]
pub struct ExtensionPointHandle {
	resolver: Arc<dyn ObjectResolver>,
	id: ObjectId,
}

impl ExtensionPointHandle {
	pub(crate) fn new(resolver: Arc<dyn ObjectResolver>, id: ObjectId) -> Self {
		Self { resolver, id }
	}

	pub fn id(&self) -> ObjectId {
		self.id
	}

	/// Snapshot of the underlying object.
	pub fn object(&self) -> Result<Arc<ExtensionPoint>> {
		resolve_as(&*self.resolver, self.id, ObjectKind::ExtensionPoint, |object| match object {
			RegistryObject::ExtensionPoint(point) => Some(point),
			_ => None,
		})
	}

	pub fn is_valid(&self) -> bool {
		self.object().is_ok()
	}

	pub fn unique_identifier(&self) -> Result<String> {
		Ok(self.object()?.unique_id().to_owned())
	}

	pub fn simple_identifier(&self) -> Result<String> {
		Ok(self.object()?.simple_id().to_owned())
	}

	pub fn namespace(&self) -> Result<String> {
		Ok(self.object()?.namespace().to_owned())
	}

	pub fn label(&self) -> Result<String> {
		Ok(self.object()?.label().to_owned())
	}

	pub fn schema_reference(&self) -> Result<Option<String>> {
		Ok(self.object()?.schema().map(str::to_owned))
	}

	pub fn contributor(&self) -> Result<ContributorId> {
		Ok(self.object()?.contributor())
	}

	/// Linked extensions, in link order.
	pub fn extensions(&self) -> Result<Vec<ExtensionHandle>> {
		let point = self.object()?;
		Ok(point
			.raw_children()
			.iter()
			.map(|&id| ExtensionHandle::new(self.resolver.clone(), id))
			.collect())
	}

	/// Finds a linked extension by its fully-qualified id.
	pub fn extension(&self, unique_id: &str) -> Result<Option<ExtensionHandle>> {
		for extension in self.extensions()? {
			if extension.object()?.unique_id().as_deref() == Some(unique_id) {
				return Ok(Some(extension));
			}
		}
		Ok(None)
	}

	/// Top-level configuration elements of every linked extension.
	pub fn configuration_elements(&self) -> Result<Vec<ConfigurationElementHandle>> {
		let mut out = Vec::new();
		for extension in self.extensions()? {
			out.extend(extension.configuration_elements()?);
		}
		Ok(out)
	}
}

/// Handle to an extension.
#[derive(Clone)]
pub struct ExtensionHandle {
	resolver: Arc<dyn ObjectResolver>,
	id: ObjectId,
}

impl ExtensionHandle {
	pub(crate) fn new(resolver: Arc<dyn ObjectResolver>, id: ObjectId) -> Self {
		Self { resolver, id }
	}

	pub fn id(&self) -> ObjectId {
		self.id
	}

	pub fn object(&self) -> Result<Arc<Extension>> {
		resolve_as(&*self.resolver, self.id, ObjectKind::Extension, |object| match object {
			RegistryObject::Extension(extension) => Some(extension),
			_ => None,
		})
	}

	pub fn is_valid(&self) -> bool {
		self.object().is_ok()
	}

	pub fn unique_identifier(&self) -> Result<Option<String>> {
		Ok(self.object()?.unique_id())
	}

	pub fn simple_identifier(&self) -> Result<Option<String>> {
		Ok(self.object()?.simple_id().map(str::to_owned))
	}

	pub fn label(&self) -> Result<String> {
		Ok(self.object()?.label().to_owned())
	}

	pub fn namespace(&self) -> Result<String> {
		Ok(self.object()?.namespace().to_owned())
	}

	pub fn extension_point_unique_identifier(&self) -> Result<String> {
		Ok(self.object()?.extension_point_id().to_owned())
	}

	pub fn contributor(&self) -> Result<ContributorId> {
		Ok(self.object()?.contributor())
	}

	pub fn configuration_elements(&self) -> Result<Vec<ConfigurationElementHandle>> {
		let extension = self.object()?;
		Ok(extension
			.raw_children()
			.iter()
			.map(|&id| ConfigurationElementHandle::new(self.resolver.clone(), id))
			.collect())
	}
}

/// What a configuration element is attached to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ElementParent {
	Extension(ExtensionHandle),
	Element(ConfigurationElementHandle),
}

/// Handle to a configuration element.
#[derive(Clone)]
pub struct ConfigurationElementHandle {
	resolver: Arc<dyn ObjectResolver>,
	id: ObjectId,
}

impl ConfigurationElementHandle {
	pub(crate) fn new(resolver: Arc<dyn ObjectResolver>, id: ObjectId) -> Self {
		Self { resolver, id }
	}

	pub fn id(&self) -> ObjectId {
		self.id
	}

	pub fn object(&self) -> Result<Arc<ConfigurationElement>> {
		resolve_as(&*self.resolver, self.id, ObjectKind::ConfigurationElement, |object| match object {
			RegistryObject::ConfigurationElement(element) => Some(element),
			_ => None,
		})
	}

	pub fn is_valid(&self) -> bool {
		self.object().is_ok()
	}

	pub fn name(&self) -> Result<String> {
		Ok(self.object()?.name().to_owned())
	}

	pub fn attribute(&self, key: &str) -> Result<Option<String>> {
		Ok(self.object()?.attribute(key).map(str::to_owned))
	}

	pub fn attribute_names(&self) -> Result<Vec<String>> {
		Ok(self.object()?.attribute_names().map(str::to_owned).collect())
	}

	pub fn value(&self) -> Result<Option<String>> {
		Ok(self.object()?.value().map(str::to_owned))
	}

	pub fn children(&self) -> Result<Vec<ConfigurationElementHandle>> {
		let element = self.object()?;
		Ok(element
			.raw_children()
			.iter()
			.map(|&id| ConfigurationElementHandle::new(self.resolver.clone(), id))
			.collect())
	}

	pub fn children_named(&self, name: &str) -> Result<Vec<ConfigurationElementHandle>> {
		let mut out = Vec::new();
		for child in self.children()? {
			if child.object()?.name() == name {
				out.push(child);
			}
		}
		Ok(out)
	}

	pub fn parent(&self) -> Result<ElementParent> {
		let (parent, kind) = self.object()?.parent();
		Ok(match kind {
			ParentKind::Extension => ElementParent::Extension(ExtensionHandle::new(self.resolver.clone(), parent)),
			ParentKind::ConfigurationElement => {
				ElementParent::Element(ConfigurationElementHandle::new(self.resolver.clone(), parent))
			}
		})
	}

	/// Walks up the tree to the extension this element belongs to.
	pub fn declaring_extension(&self) -> Result<ExtensionHandle> {
		let mut current = self.clone();
		loop {
			match current.parent()? {
				ElementParent::Extension(extension) => return Ok(extension),
				ElementParent::Element(element) => current = element,
			}
		}
	}
}

macro_rules! impl_handle_traits {
	($($handle:ident),*) => {$(
		impl PartialEq for $handle {
			fn eq(&self, other: &Self) -> bool {
				self.id == other.id
			}
		}

		impl Eq for $handle {}

		impl std::hash::Hash for $handle {
			fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
				self.id.hash(state);
			}
		}

		impl fmt::Debug for $handle {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.debug_struct(stringify!($handle)).field("id", &self.id).finish()
			}
		}
	)*};
}

impl_handle_traits!(ExtensionPointHandle, ExtensionHandle, ConfigurationElementHandle);
