//! Background delivery of change events.
//!
//! # Role
//!
//! Writers enqueue `(listener snapshot, deltas)` pairs and return at once.
//! A single named worker thread drains the queue in FIFO order and runs
//! [`process_change_event`] for each pair.
//!
//! # Invariants
//!
//! - At most one worker exists per dispatcher; it is spawned on the first
//!   [`ChangeDispatcher::schedule`].
//! - Events are delivered in scheduling order, one at a time.
//! - [`ChangeDispatcher::stop`] drops everything still queued and closes the
//!   dropped deltas. Events scheduled after stop are closed immediately.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::delta::DeltaMap;
use crate::events::{DispatchStatus, ListenerInfo, process_change_event};

/// Name of the worker thread.
pub const DISPATCHER_THREAD_NAME: &str = "Extension Registry Event Dispatcher";

struct QueuedEvent {
	listeners: Arc<Vec<ListenerInfo>>,
	deltas: DeltaMap,
}

#[derive(Default)]
struct QueueState {
	items: VecDeque<QueuedEvent>,
	stopped: bool,
}

#[derive(Default)]
struct Shared {
	queue: Mutex<QueueState>,
	ready: Condvar,
}

/// Owns the dispatcher worker and its queue.
pub struct ChangeDispatcher {
	shared: Arc<Shared>,
	worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for ChangeDispatcher {
	fn default() -> Self {
		Self::new()
	}
}

impl ChangeDispatcher {
	pub fn new() -> Self {
		Self {
			shared: Arc::new(Shared::default()),
			worker: Mutex::new(None),
		}
	}

	/// Queues one event for delivery.
	pub fn schedule(&self, listeners: Arc<Vec<ListenerInfo>>, deltas: DeltaMap) {
		{
			let mut queue = self.shared.queue.lock();
			if queue.stopped {
				drop(queue);
				tracing::debug!(namespaces = deltas.len(), "dispatcher stopped; change event dropped");
				close_all(&deltas);
				return;
			}
			queue.items.push_back(QueuedEvent { listeners, deltas });
			tracing::trace!(queued = queue.items.len(), "registry change event scheduled");
		}
		self.ensure_worker();
		self.shared.ready.notify_one();
	}

	fn ensure_worker(&self) {
		let mut worker = self.worker.lock();
		if worker.is_some() {
			return;
		}
		let shared = self.shared.clone();
		match std::thread::Builder::new()
			.name(DISPATCHER_THREAD_NAME.to_owned())
			.spawn(move || run(&shared))
		{
			Ok(handle) => *worker = Some(handle),
			Err(error) => {
				tracing::warn!(error = %error, "failed to spawn registry event dispatcher");
				let dropped = std::mem::take(&mut self.shared.queue.lock().items);
				for event in dropped {
					close_all(&event.deltas);
				}
			}
		}
	}

	/// Number of events waiting for the worker.
	pub fn pending(&self) -> usize {
		self.shared.queue.lock().items.len()
	}

	pub fn is_stopped(&self) -> bool {
		self.shared.queue.lock().stopped
	}

	/// Stops the worker, dropping queued events.
	///
	/// Joins the worker unless called from the worker thread itself, in which
	/// case the worker exits once the current listener returns.
	pub fn stop(&self) {
		let dropped = {
			let mut queue = self.shared.queue.lock();
			queue.stopped = true;
			std::mem::take(&mut queue.items)
		};
		if !dropped.is_empty() {
			tracing::debug!(dropped = dropped.len(), "queued registry change events dropped at stop");
		}
		for event in &dropped {
			close_all(&event.deltas);
		}
		self.shared.ready.notify_all();

		let Some(handle) = self.worker.lock().take() else {
			return;
		};
		if handle.thread().id() == std::thread::current().id() {
			return;
		}
		if handle.join().is_err() {
			tracing::warn!("registry event dispatcher panicked");
		}
	}
}

impl Drop for ChangeDispatcher {
	fn drop(&mut self) {
		self.stop();
	}
}

fn run(shared: &Shared) {
	tracing::trace!("registry event dispatcher started");
	loop {
		let event = {
			let mut queue = shared.queue.lock();
			loop {
				if queue.stopped {
					tracing::trace!("registry event dispatcher exiting");
					return;
				}
				if let Some(event) = queue.items.pop_front() {
					break event;
				}
				shared.ready.wait(&mut queue);
			}
		};
		let status = process_change_event(&event.listeners, &event.deltas);
		report(&status);
	}
}

fn report(status: &DispatchStatus) {
	if !status.is_ok() {
		tracing::warn!(
			delivered = status.delivered,
			failed = status.failures.len(),
			"problems occurred during registry change notification"
		);
	}
}

fn close_all(deltas: &DeltaMap) {
	for delta in deltas.values() {
		delta.close();
	}
}
