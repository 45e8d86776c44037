//! Change listeners and the events delivered to them.
//!
//! # Role
//!
//! A write that linked or unlinked extensions produces a [`DeltaMap`]. The
//! dispatcher pairs it with the listener snapshot taken when the write was
//! scheduled and hands both to [`process_change_event`].
//!
//! # Invariants
//!
//! - A listener registered with a namespace filter is only called when that
//!   namespace has a delta, and only sees that namespace through the event.
//! - A failing or panicking listener does not stop the remaining listeners.
//! - Every delta's object view is closed after the last listener returns.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::delta::{DeltaKind, DeltaMap, ExtensionDelta, RegistryDelta};
use crate::handles::{ExtensionHandle, ExtensionPointHandle, ObjectResolver};
use crate::objects::qualify;

/// Receives registry change events on the dispatcher thread.
pub trait RegistryChangeListener: Send + Sync {
	fn registry_changed(&self, event: &RegistryChangeEvent<'_>) -> anyhow::Result<()>;
}

impl<F> RegistryChangeListener for F
where
	F: Fn(&RegistryChangeEvent<'_>) -> anyhow::Result<()> + Send + Sync,
{
	fn registry_changed(&self, event: &RegistryChangeEvent<'_>) -> anyhow::Result<()> {
		self(event)
	}
}

/// A registered listener with its optional namespace filter.
#[derive(Clone)]
pub struct ListenerInfo {
	pub(crate) listener: Arc<dyn RegistryChangeListener>,
	pub(crate) filter: Option<String>,
}

impl ListenerInfo {
	pub fn new(listener: Arc<dyn RegistryChangeListener>, filter: Option<String>) -> Self {
		Self { listener, filter }
	}

	pub fn filter(&self) -> Option<&str> {
		self.filter.as_deref()
	}

	/// Identity comparison on the listener allocation.
	pub(crate) fn is_listener(&self, listener: &Arc<dyn RegistryChangeListener>) -> bool {
		std::ptr::addr_eq(Arc::as_ptr(&self.listener), Arc::as_ptr(listener))
	}

	fn accepts(&self, deltas: &DeltaMap) -> bool {
		match &self.filter {
			None => true,
			Some(namespace) => deltas.contains_key(namespace),
		}
	}
}

impl std::fmt::Debug for ListenerInfo {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ListenerInfo").field("filter", &self.filter).finish_non_exhaustive()
	}
}

/// One extension delta with handles resolved through its transaction's objects.
#[derive(Debug, Clone)]
pub struct ExtensionDeltaView {
	delta: ExtensionDelta,
	extension: ExtensionHandle,
	extension_point: ExtensionPointHandle,
}

impl ExtensionDeltaView {
	fn new(delta: ExtensionDelta, resolver: Arc<dyn ObjectResolver>) -> Self {
		Self {
			extension: ExtensionHandle::new(resolver.clone(), delta.extension),
			extension_point: ExtensionPointHandle::new(resolver, delta.extension_point),
			delta,
		}
	}

	pub fn kind(&self) -> DeltaKind {
		self.delta.kind
	}

	pub fn extension(&self) -> &ExtensionHandle {
		&self.extension
	}

	pub fn extension_point(&self) -> &ExtensionPointHandle {
		&self.extension_point
	}

	pub fn raw(&self) -> ExtensionDelta {
		self.delta
	}
}

/// The deltas of one write, as seen by one listener.
#[derive(Debug)]
pub struct RegistryChangeEvent<'a> {
	deltas: &'a DeltaMap,
	filter: Option<&'a str>,
}

impl<'a> RegistryChangeEvent<'a> {
	pub fn new(deltas: &'a DeltaMap, filter: Option<&'a str>) -> Self {
		Self { deltas, filter }
	}

	fn visible(&self, namespace: &str) -> Option<&'a RegistryDelta> {
		if self.filter.is_some_and(|filter| filter != namespace) {
			return None;
		}
		self.deltas.get(namespace)
	}

	fn views(delta: &RegistryDelta) -> impl Iterator<Item = ExtensionDeltaView> + '_ {
		let resolver = delta.object_manager().map(|objects| objects.clone() as Arc<dyn ObjectResolver>);
		delta
			.extension_deltas()
			.iter()
			.filter_map(move |raw| resolver.clone().map(|resolver| ExtensionDeltaView::new(*raw, resolver)))
	}

	/// Namespaces with at least one delta visible to this listener.
	pub fn namespaces(&self) -> Vec<&'a str> {
		self.deltas
			.keys()
			.map(String::as_str)
			.filter(|namespace| self.filter.is_none_or(|filter| filter == *namespace))
			.collect()
	}

	/// Every visible delta, grouped by namespace in first-touched order.
	pub fn extension_deltas(&self) -> Vec<ExtensionDeltaView> {
		match self.filter {
			Some(namespace) => self.extension_deltas_in(namespace),
			None => self.deltas.values().flat_map(Self::views).collect(),
		}
	}

	pub fn extension_deltas_in(&self, namespace: &str) -> Vec<ExtensionDeltaView> {
		self.visible(namespace).map(|delta| Self::views(delta).collect()).unwrap_or_default()
	}

	/// Deltas touching the point `namespace.point_local_id`.
	pub fn extension_deltas_for(&self, namespace: &str, point_local_id: &str) -> Vec<ExtensionDeltaView> {
		let point_id = qualify(namespace, point_local_id);
		self.extension_deltas_in(namespace)
			.into_iter()
			.filter(|view| {
				view.extension_point
					.unique_identifier()
					.is_ok_and(|unique_id| unique_id == point_id)
			})
			.collect()
	}

	/// The delta of one extension on the point `namespace.point_local_id`.
	pub fn extension_delta(
		&self,
		namespace: &str,
		point_local_id: &str,
		extension_id: &str,
	) -> Option<ExtensionDeltaView> {
		self.extension_deltas_for(namespace, point_local_id)
			.into_iter()
			.find(|view| {
				view.extension
					.unique_identifier()
					.is_ok_and(|unique_id| unique_id.as_deref() == Some(extension_id))
			})
	}
}

/// A listener that returned an error or panicked.
#[derive(Debug)]
pub struct ListenerFailure {
	pub filter: Option<String>,
	pub error: anyhow::Error,
}

/// Aggregate outcome of delivering one event.
#[derive(Debug, Default)]
pub struct DispatchStatus {
	pub delivered: usize,
	pub failures: Vec<ListenerFailure>,
}

impl DispatchStatus {
	pub fn is_ok(&self) -> bool {
		self.failures.is_empty()
	}
}

/// Delivers `deltas` to each interested listener in order, then closes the deltas.
pub fn process_change_event(listeners: &[ListenerInfo], deltas: &DeltaMap) -> DispatchStatus {
	let mut status = DispatchStatus::default();
	for info in listeners {
		if !info.accepts(deltas) {
			continue;
		}
		let event = RegistryChangeEvent::new(deltas, info.filter.as_deref());
		let outcome = catch_unwind(AssertUnwindSafe(|| info.listener.registry_changed(&event)));
		let error = match outcome {
			Ok(Ok(())) => {
				status.delivered += 1;
				continue;
			}
			Ok(Err(error)) => error,
			Err(payload) => anyhow::anyhow!("listener panicked: {}", panic_message(payload.as_ref())),
		};
		tracing::warn!(filter = ?info.filter, error = %error, "registry change listener failed");
		status.failures.push(ListenerFailure {
			filter: info.filter.clone(),
			error,
		});
	}
	for delta in deltas.values() {
		delta.close();
	}
	status
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
	payload
		.downcast_ref::<&str>()
		.copied()
		.or_else(|| payload.downcast_ref::<String>().map(String::as_str))
		.unwrap_or("non-string panic payload")
}

/// Built-in listener installed by `RegistryConfig::debug_events`.
pub(crate) struct EventLogger;

impl RegistryChangeListener for EventLogger {
	fn registry_changed(&self, event: &RegistryChangeEvent<'_>) -> anyhow::Result<()> {
		for view in event.extension_deltas() {
			tracing::info!(
				kind = ?view.kind(),
				extension = %view.raw().extension,
				extension_point = ?view.extension_point().unique_identifier().ok(),
				"registry change"
			);
		}
		Ok(())
	}
}
