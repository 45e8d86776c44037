use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use pretty_assertions::assert_eq;

use super::*;
use crate::cache::format::Section;
use crate::declaration::ParseReport;
use crate::delta::DeltaKind;
use crate::events::RegistryChangeEvent;
use crate::strategy::NamespaceTable;

const A: ContributorId = ContributorId(1);
const B: ContributorId = ContributorId(2);
const ANONYMOUS: ContributorId = ContributorId(99);

fn namespaces() -> NamespaceTable {
	NamespaceTable::new().with_namespace(A, "A").with_namespace(B, "B")
}

fn open() -> ExtensionRegistry {
	ExtensionRegistry::open(RegistryConfig::default(), Arc::new(namespaces()))
}

fn widgets() -> Declaration {
	Declaration::new(A).with_extension_point(ExtensionPointDecl::new("widgets").with_label("Widgets"))
}

fn red() -> Declaration {
	Declaration::new(B).with_extension(
		ExtensionDecl::new("A.widgets")
			.with_id("red")
			.with_label("Red")
			.with_content(
				ExtensionDescription::new("widget")
					.with_property("class", "org.b.Red")
					.with_child(ExtensionDescription::new("shade").with_value("dark")),
			),
	)
}

type Seen = Vec<(Option<String>, DeltaKind)>;

/// Registers a listener forwarding each event's deltas over a channel.
fn subscribe(registry: &ExtensionRegistry, filter: Option<&str>) -> (Arc<dyn RegistryChangeListener>, mpsc::Receiver<Seen>) {
	let (tx, rx) = mpsc::channel();
	let listener = move |event: &RegistryChangeEvent<'_>| -> anyhow::Result<()> {
		let mut seen = Vec::new();
		for view in event.extension_deltas() {
			seen.push((view.extension().unique_identifier()?, view.kind()));
		}
		tx.send(seen)?;
		Ok(())
	};
	let listener: Arc<dyn RegistryChangeListener> = Arc::new(listener);
	registry.add_listener(listener.clone(), filter);
	(listener, rx)
}

fn next_event(rx: &mpsc::Receiver<Seen>) -> Seen {
	rx.recv_timeout(Duration::from_secs(10)).unwrap()
}

/// `B.red` arrives before `A.widgets`: it waits as an orphan and is reported
/// once the point shows up.
#[test]
fn test_extension_waits_for_its_point() {
	let registry = open();
	let (_listener, rx) = subscribe(&registry, Some("A"));

	registry.add(red()).unwrap();
	assert!(registry.extension_point("A.widgets").is_none());
	assert!(registry.extension("B.red").is_none());
	assert!(registry.extensions_in("B").is_empty());

	registry.add(widgets()).unwrap();
	assert_eq!(next_event(&rx), vec![(Some("B.red".to_owned()), DeltaKind::Added)]);

	let point = registry.extension_point("A.widgets").unwrap();
	let linked = point.extensions().unwrap();
	assert_eq!(linked.len(), 1);
	assert_eq!(linked[0].unique_identifier().unwrap().as_deref(), Some("B.red"));
	assert_eq!(registry.extension("B.red").unwrap(), linked[0]);

	assert!(registry.remove(B).unwrap());
	assert_eq!(next_event(&rx), vec![(Some("B.red".to_owned()), DeltaKind::Removed)]);
	assert!(point.extensions().unwrap().is_empty());
	assert!(!registry.has_contributor(B));
	registry.stop(None).unwrap();
}

/// Removing the point's contributor parks its extensions until it returns.
#[test]
fn test_removed_point_orphans_then_relinks() {
	let registry = open();
	registry.add_all(vec![widgets(), red()]).unwrap();
	assert!(registry.extension("B.red").is_some());

	assert!(registry.remove(A).unwrap());
	assert!(registry.extension("B.red").is_none());
	assert!(registry.has_contributor(B));

	registry.add(widgets()).unwrap();
	assert!(registry.extension_in("A", "widgets", "B.red").is_some());
	registry.stop(None).unwrap();
}

#[test]
fn test_filtered_listener_skips_other_namespaces() {
	let registry = open();
	let (_on_z, z_rx) = subscribe(&registry, Some("Z"));
	let (_all, all_rx) = subscribe(&registry, None);

	registry.add_all(vec![widgets(), red()]).unwrap();
	assert_eq!(next_event(&all_rx), vec![(Some("B.red".to_owned()), DeltaKind::Added)]);
	registry.stop(None).unwrap();
	assert!(z_rx.try_recv().is_err());
}

#[test]
fn test_listener_registration() {
	let registry = open();
	let (listener, rx) = subscribe(&registry, None);
	registry.add_listener(listener.clone(), Some("A"));
	assert_eq!(registry.listener_count(), 1);

	registry.remove_listener(&listener);
	assert_eq!(registry.listener_count(), 0);
	registry.add_all(vec![widgets(), red()]).unwrap();
	registry.stop(None).unwrap();
	assert!(rx.try_recv().is_err());
}

#[test]
fn test_queries() {
	let registry = open();
	registry.add_all(vec![widgets(), red()]).unwrap();
	registry
		.add(Declaration::new(B).with_extension(ExtensionDecl::new("A.gadgets").with_id("lost")))
		.unwrap();

	assert_eq!(registry.namespaces(), vec!["A".to_owned(), "B".to_owned()]);
	assert_eq!(registry.extension_points().len(), 1);
	assert_eq!(registry.extension_points_in("A").len(), 1);
	assert!(registry.extension_points_in("B").is_empty());
	assert_eq!(registry.extension_point_in("A", "widgets").unwrap().label().unwrap(), "Widgets");

	let in_b = registry.extensions_in("B");
	assert_eq!(in_b.len(), 1);
	assert_eq!(in_b[0].simple_identifier().unwrap().as_deref(), Some("red"));
	assert!(registry.extension("B.lost").is_none());

	let elements = registry.configuration_elements_for("A.widgets");
	assert_eq!(elements.len(), 1);
	assert_eq!(elements[0].attribute("class").unwrap().as_deref(), Some("org.b.Red"));
	let shades = elements[0].children_named("shade").unwrap();
	assert_eq!(shades[0].value().unwrap().as_deref(), Some("dark"));
	assert_eq!(shades[0].declaring_extension().unwrap(), in_b[0]);

	assert_eq!(registry.configuration_elements_in("A", "widgets"), elements);
	assert_eq!(registry.configuration_elements_for_extension("A", "widgets", "B.red"), elements);
	assert!(registry.configuration_elements_for_extension("A", "widgets", "B.lost").is_empty());
	assert!(registry.configuration_elements_for("A.gadgets").is_empty());
	registry.stop(None).unwrap();
}

/// Handles outlive their objects and then report them invalid.
#[test]
fn test_stale_handle_is_invalid() {
	let registry = open();
	registry.add_all(vec![widgets(), red()]).unwrap();
	let extension = registry.extension("B.red").unwrap();
	let element = registry.configuration_elements_for("A.widgets").remove(0);

	registry.remove(B).unwrap();
	assert!(!extension.is_valid());
	assert!(matches!(extension.label(), Err(RegistryError::InvalidObject { .. })));
	assert!(matches!(element.name(), Err(RegistryError::InvalidObject { .. })));
	registry.stop(None).unwrap();
}

#[test]
fn test_duplicate_point_is_rejected() {
	let registry = open();
	assert!(registry.create_extension_point(A, "widgets", "First", None, None).unwrap());
	assert!(registry.create_extension_point(B, "widgets", "Other namespace", None, None).unwrap());
	assert!(!registry.create_extension_point(A, "widgets", "Second", None, None).unwrap());
	assert_eq!(registry.extension_point("A.widgets").unwrap().label().unwrap(), "First");
	assert!(matches!(
		registry.create_extension_point(A, "", "", None, None),
		Err(RegistryError::MissingArgument(_))
	));
	registry.stop(None).unwrap();
}

#[test]
fn test_anonymous_contributor_is_ignored() {
	let registry = open();
	assert!(!registry.create_extension_point(ANONYMOUS, "widgets", "", None, None).unwrap());
	assert!(!registry.create_extension(ANONYMOUS, Some("red"), "", "A.widgets", Vec::new(), None).unwrap());
	registry
		.add(Declaration::new(ANONYMOUS).with_extension_point(ExtensionPointDecl::new("p")))
		.unwrap();
	assert!(registry.namespaces().is_empty());
	assert!(!registry.is_dirty());
	registry.stop(None).unwrap();
}

/// Host strategy translating `%key` labels and values.
struct Translating(NamespaceTable);

impl RegistryStrategy for Translating {
	fn namespace(&self, contributor: ContributorId) -> Option<String> {
		self.0.namespace(contributor)
	}

	fn translate(&self, value: &str) -> String {
		match value.strip_prefix('%') {
			Some(key) => key.to_uppercase(),
			None => value.to_owned(),
		}
	}
}

/// A bare target is qualified with the contributor's namespace; labels and
/// property values go through the strategy, element text does not.
#[test]
fn test_create_extension_qualifies_and_translates() {
	let registry = ExtensionRegistry::open(RegistryConfig::default(), Arc::new(Translating(namespaces())));
	assert!(registry.create_extension_point(A, "widgets", "%widgets", Some("schema/widgets.exsd"), None).unwrap());
	let content = vec![ExtensionDescription::new("widget").with_property("name", "%red").with_value("%text")];
	assert!(registry.create_extension(A, Some("own"), "%own", "widgets", content, None).unwrap());

	let point = registry.extension_point("A.widgets").unwrap();
	assert_eq!(point.label().unwrap(), "WIDGETS");
	assert_eq!(point.schema_reference().unwrap().as_deref(), Some("schema/widgets.exsd"));
	let extension = registry.extension_for_point("A.widgets", "A.own").unwrap();
	assert_eq!(extension.label().unwrap(), "OWN");
	assert_eq!(extension.extension_point_unique_identifier().unwrap(), "A.widgets");
	let element = extension.configuration_elements().unwrap().remove(0);
	assert_eq!(element.attribute("name").unwrap().as_deref(), Some("RED"));
	assert_eq!(element.value().unwrap().as_deref(), Some("%text"));
	assert!(matches!(
		registry.create_extension(A, None, "", "", Vec::new(), None),
		Err(RegistryError::MissingArgument(_))
	));
	registry.stop(None).unwrap();
}

fn parse_widgets(contributor: ContributorId, source: &[u8], _name: &str) -> std::result::Result<Declaration, ParseReport> {
	match source {
		b"widgets" => Ok(Declaration::new(contributor).with_extension_point(ExtensionPointDecl::new("widgets"))),
		_ => Err(ParseReport::single("expected `widgets`")),
	}
}

#[test]
fn test_add_from_source_reports_parse_problems() {
	let registry = open();
	assert!(!registry.add_from_source(&parse_widgets, A, b"garbage", "plugin.xml", None).unwrap());
	assert!(registry.extension_points().is_empty());
	assert!(registry.add_from_source(&parse_widgets, A, b"widgets", "plugin.xml", None).unwrap());
	assert!(registry.extension_point("A.widgets").is_some());
	registry.stop(None).unwrap();
}

/// A non-modifiable registry only accepts programmatic writes with its token.
#[test]
fn test_token_gates_writes_and_stop() {
	let token = AccessToken::new();
	let config = RegistryConfig {
		modifiable: false,
		..RegistryConfig::default()
	};
	let registry = ExtensionRegistry::open_with_token(config, Arc::new(namespaces()), token.clone());

	let stranger = AccessToken::new();
	assert!(matches!(
		registry.add_from_source(&parse_widgets, A, b"widgets", "plugin.xml", Some(&stranger)),
		Err(RegistryError::Unauthorized { operation: "add_from_source" })
	));
	assert!(matches!(
		registry.create_extension_point(A, "widgets", "", None, None),
		Err(RegistryError::Unauthorized { .. })
	));
	assert!(registry.create_extension_point(A, "widgets", "", None, Some(&token)).unwrap());

	assert!(matches!(registry.stop(None), Err(RegistryError::Unauthorized { operation: "stop" })));
	assert!(!registry.is_stopped());
	registry.stop(Some(&token)).unwrap();
	assert!(registry.is_stopped());
}

#[test]
fn test_writes_after_stop_fail() {
	let registry = open();
	registry.stop(None).unwrap();
	registry.stop(None).unwrap();
	assert!(matches!(registry.add(widgets()), Err(RegistryError::Stopped)));
	assert!(matches!(registry.remove(A), Err(RegistryError::Stopped)));
	assert!(matches!(
		registry.create_extension_point(A, "widgets", "", None, None),
		Err(RegistryError::Stopped)
	));
}

/// Stop publishes a dirty store; the next open with the same fingerprint
/// starts from it, another fingerprint starts cold.
#[test]
fn test_stop_flushes_cache_for_next_open() {
	let dir = tempfile::tempdir().unwrap();
	let config = RegistryConfig::with_cache_dir(dir.path());
	let strategy = || Arc::new(namespaces().with_fingerprint(7));

	let registry = ExtensionRegistry::open(config.clone(), strategy());
	assert!(!registry.filled_from_cache());
	registry.add_all(vec![red(), widgets()]).unwrap();
	assert!(registry.is_dirty());
	registry.stop(None).unwrap();
	assert!(!registry.is_dirty());

	let reopened = ExtensionRegistry::open(config.clone(), strategy());
	assert!(reopened.filled_from_cache());
	assert!(!reopened.is_dirty());
	let elements = reopened.configuration_elements_for_extension("A", "widgets", "B.red");
	assert_eq!(elements[0].attribute("class").unwrap().as_deref(), Some("org.b.Red"));
	reopened.create_extension_point(A, "gadgets", "", None, None).unwrap();
	assert_eq!(reopened.extension_point("A.gadgets").unwrap().id(), ObjectId(4));
	reopened.stop(None).unwrap();

	let other = ExtensionRegistry::open(config.clone(), Arc::new(namespaces().with_fingerprint(8)));
	assert!(!other.filled_from_cache());
	assert!(other.clear_cache());
	other.stop(None).unwrap();

	let cold = ExtensionRegistry::open(config, strategy());
	assert!(!cold.filled_from_cache());
	cold.stop(None).unwrap();
}

#[test]
fn test_use_cache_false_starts_cold() {
	let dir = tempfile::tempdir().unwrap();
	let registry = ExtensionRegistry::open(RegistryConfig::with_cache_dir(dir.path()), Arc::new(namespaces()));
	registry.add(widgets()).unwrap();
	registry.stop(None).unwrap();

	let config = RegistryConfig {
		use_cache: false,
		..RegistryConfig::with_cache_dir(dir.path())
	};
	let registry = ExtensionRegistry::open(config, Arc::new(namespaces()));
	assert!(!registry.filled_from_cache());
	assert!(registry.extension_point("A.widgets").is_none());
	registry.stop(None).unwrap();
}

#[test]
fn test_clear_cache_without_location() {
	let registry = open();
	assert!(!registry.clear_cache());
	registry.stop(None).unwrap();
}

/// A failed publish at stop is logged, not returned. The store stays dirty
/// and readable, and the last published generation stays in effect.
#[test]
fn test_failed_cache_write_is_not_fatal() {
	let published = tempfile::tempdir().unwrap();
	let registry = ExtensionRegistry::open(RegistryConfig::with_cache_dir(published.path()), Arc::new(namespaces()));
	registry.add(widgets()).unwrap();
	registry.stop(None).unwrap();

	let blocked = tempfile::tempdir().unwrap();
	std::fs::create_dir(blocked.path().join(Section::Manifest.file_name())).unwrap();
	let config = RegistryConfig {
		alternative_cache_dir: Some(published.path().to_path_buf()),
		..RegistryConfig::with_cache_dir(blocked.path())
	};
	let registry = ExtensionRegistry::open(config.clone(), Arc::new(namespaces()));
	assert!(registry.filled_from_cache());
	registry.add(red()).unwrap();

	registry.stop(None).unwrap();
	assert!(registry.is_dirty());
	assert!(registry.extension("B.red").is_some());

	let reopened = ExtensionRegistry::open(config, Arc::new(namespaces()));
	assert!(reopened.filled_from_cache());
	assert!(reopened.extension_point("A.widgets").is_some());
	assert!(reopened.extension("B.red").is_none());
	reopened.stop(None).unwrap();
}

#[test]
fn test_read_only_cache_is_never_written() {
	let dir = tempfile::tempdir().unwrap();
	let config = RegistryConfig {
		cache_read_only: true,
		..RegistryConfig::with_cache_dir(dir.path())
	};
	let registry = ExtensionRegistry::open(config, Arc::new(namespaces()));
	registry.add(widgets()).unwrap();
	registry.stop(None).unwrap();

	assert!(registry.is_dirty());
	assert!(!dir.path().join(Section::Manifest.file_name()).exists());
	assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

/// A write that races stop either lands in the final flush or fails with
/// `Stopped`; it never returns `Ok` and misses the cache.
#[test]
fn write_racing_stop_is_flushed_or_rejected() {
	let dir = tempfile::tempdir().unwrap();
	let config = RegistryConfig::with_cache_dir(dir.path());
	let registry = Arc::new(ExtensionRegistry::open(config.clone(), Arc::new(namespaces())));
	registry.add(widgets()).unwrap();

	let held = registry.state.write();
	let writer = {
		let registry = registry.clone();
		thread::spawn(move || registry.create_extension_point(B, "gadgets", "", None, None))
	};
	let stopper = {
		let registry = registry.clone();
		thread::spawn(move || registry.stop(None))
	};
	thread::sleep(Duration::from_millis(50));
	drop(held);
	let written = writer.join().unwrap();
	stopper.join().unwrap().unwrap();

	let reopened = ExtensionRegistry::open(config, Arc::new(namespaces()));
	assert!(reopened.filled_from_cache());
	assert!(reopened.extension_point("A.widgets").is_some());
	match written {
		Ok(added) => {
			assert!(added);
			assert!(reopened.extension_point("B.gadgets").is_some());
		}
		Err(error) => {
			assert!(matches!(error, RegistryError::Stopped));
			assert!(reopened.extension_point("B.gadgets").is_none());
		}
	}
	reopened.stop(None).unwrap();
}

/// `debug_events` registers the logging listener, which also turns on delta
/// recording for writes nobody else is listening to.
#[test]
fn test_debug_events_installs_logger() {
	let config = RegistryConfig {
		debug_events: true,
		..RegistryConfig::default()
	};
	let registry = ExtensionRegistry::open(config, Arc::new(namespaces()));
	assert_eq!(registry.listener_count(), 1);
	assert!(registry.listeners.load()[0].filter().is_none());

	registry.add_all(vec![widgets(), red()]).unwrap();
	let (_listener, rx) = subscribe(&registry, None);
	assert_eq!(registry.listener_count(), 2);
	registry.remove(B).unwrap();
	assert_eq!(next_event(&rx), vec![(Some("B.red".to_owned()), DeltaKind::Removed)]);
	registry.stop(None).unwrap();
}

#[derive(Default)]
struct Hooks {
	table: NamespaceTable,
	started: AtomicUsize,
	stopped: AtomicUsize,
	dispatcher_running_at_stop: AtomicBool,
}

impl RegistryStrategy for Hooks {
	fn namespace(&self, contributor: ContributorId) -> Option<String> {
		self.table.namespace(contributor)
	}

	fn on_start(&self, _registry: &ExtensionRegistry) {
		self.started.fetch_add(1, Ordering::SeqCst);
	}

	fn on_stop(&self, registry: &ExtensionRegistry) {
		self.stopped.fetch_add(1, Ordering::SeqCst);
		self.dispatcher_running_at_stop
			.store(!registry.dispatcher.is_stopped(), Ordering::SeqCst);
	}
}

/// `on_start` runs once at open; `on_stop` runs once, before the dispatcher stops.
#[test]
fn test_strategy_lifecycle_hooks() {
	let hooks = Arc::new(Hooks {
		table: namespaces(),
		..Hooks::default()
	});
	let token = AccessToken::new();
	let registry = ExtensionRegistry::open_with_token(RegistryConfig::default(), hooks.clone(), token.clone());
	assert_eq!(hooks.started.load(Ordering::SeqCst), 1);
	assert_eq!(hooks.stopped.load(Ordering::SeqCst), 0);

	assert!(registry.stop(None).is_err());
	assert_eq!(hooks.stopped.load(Ordering::SeqCst), 0);
	registry.stop(Some(&token)).unwrap();
	registry.stop(Some(&token)).unwrap();
	assert_eq!(hooks.stopped.load(Ordering::SeqCst), 1);
	assert!(hooks.dispatcher_running_at_stop.load(Ordering::SeqCst));
	assert_eq!(hooks.started.load(Ordering::SeqCst), 1);
}

const FRAGMENT: ContributorId = ContributorId(3);

/// Strategy where every contributor's namespace is owned by `A`.
struct OwnedByA(NamespaceTable);

impl RegistryStrategy for OwnedByA {
	fn namespace(&self, contributor: ContributorId) -> Option<String> {
		self.0.namespace(contributor)
	}

	fn namespace_owner(&self, _contributor: ContributorId) -> ContributorId {
		A
	}
}

#[test]
fn test_namespace_owner_comes_from_strategy() {
	let strategy = OwnedByA(namespaces().with_namespace(FRAGMENT, "A"));
	let registry = ExtensionRegistry::open(RegistryConfig::default(), Arc::new(strategy));
	assert!(registry.create_extension_point(FRAGMENT, "widgets", "", None, None).unwrap());
	let content = vec![ExtensionDescription::new("widget")];
	assert!(registry.create_extension(FRAGMENT, Some("own"), "", "widgets", content, None).unwrap());

	let point = registry.extension_point("A.widgets").unwrap().object().unwrap();
	assert_eq!(point.contributor(), FRAGMENT);
	assert_eq!(point.namespace_owner(), A);
	let element = registry.configuration_elements_for("A.widgets").remove(0).object().unwrap();
	assert_eq!(element.contributor(), FRAGMENT);
	assert_eq!(element.namespace_owner(), A);
	registry.stop(None).unwrap();
}
