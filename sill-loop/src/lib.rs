//! Single-threaded cooperative reactor.
//!
//! Two task kinds are registered against the loop:
//!
//! - I/O sources: runnable when their file descriptor reports a requested
//!   condition. Every turn calls [`IoSource::prepare`] on each of them before
//!   the loop blocks, so pending outgoing writes can be flushed and
//!   already-queued incoming work drained.
//! - Deferred sources: fd-free, runnable once their [`Trigger`] has been
//!   marked. Marks coalesce; the flag is cleared before the callback runs, so
//!   a mark made during dispatch schedules exactly one further run.
//!
//! A turn snapshots the runnable set right after polling and dispatches it in
//! priority order. Triggers marked while that snapshot is being dispatched
//! run on the *next* turn; this keeps wire-level event processing decoupled
//! from the notifications it schedules.
//!
//! The reactor owns no thread and never blocks outside [`Reactor::turn`];
//! the host decides when and how long to wait.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use thiserror::Error;
use tracing::trace;

/// Priority of ordinary host/application sources.
pub const PRIORITY_DEFAULT: i32 = 0;
/// Priority of idle work; sources at or past this run after everything else.
pub const PRIORITY_IDLE: i32 = 200;

/// Errors surfaced by the reactor.
#[derive(Debug, Error)]
pub enum LoopError {
	#[error("poll failed: {0}")]
	Poll(std::io::Error),
}

/// Conditions observed on an I/O source's descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
	/// Descriptor has readable data.
	pub readable: bool,
	/// Descriptor is in an error state.
	pub error: bool,
	/// Peer hung up.
	pub hangup: bool,
}

impl Readiness {
	fn from_revents(revents: i16) -> Self {
		Self {
			readable: (revents & libc::POLLIN) != 0,
			error: (revents & (libc::POLLERR | libc::POLLNVAL)) != 0,
			hangup: (revents & libc::POLLHUP) != 0,
		}
	}

	/// Returns `true` when any condition is set.
	pub fn any(&self) -> bool {
		self.readable || self.error || self.hangup
	}
}

/// What the reactor should do with an I/O source after dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
	/// Keep the source armed.
	Continue,
	/// Detach and drop the source.
	Remove,
}

/// Identifier of a registered source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(u64);

/// A task driven by file-descriptor readiness.
pub trait IoSource {
	/// Called every turn before the loop blocks. Flush pending writes and
	/// drain already-queued incoming work here; never read the descriptor.
	fn prepare(&mut self) {}

	/// Called when the descriptor reported a condition.
	fn dispatch(&mut self, ready: Readiness) -> Directive;
}

/// Cloneable ready flag for a deferred source.
///
/// Marking is idempotent: repeated marks before the next run coalesce into a
/// single dispatch.
#[derive(Debug, Clone, Default)]
pub struct Trigger {
	flag: Rc<Cell<bool>>,
}

impl Trigger {
	/// Creates an unmarked trigger.
	pub fn new() -> Self {
		Self::default()
	}

	/// Schedules the owning deferred source for the next turn.
	pub fn mark(&self) {
		self.flag.set(true);
	}

	/// Returns `true` when a mark is pending.
	pub fn is_marked(&self) -> bool {
		self.flag.get()
	}

	fn take(&self) -> bool {
		self.flag.replace(false)
	}
}

enum TaskKind {
	Io {
		fd: RawFd,
		revents: i16,
		source: Box<dyn IoSource>,
	},
	Deferred {
		trigger: Trigger,
		callback: Box<dyn FnMut()>,
	},
}

struct Task {
	name: &'static str,
	priority: i32,
	kind: TaskKind,
}

#[derive(Default)]
struct Inner {
	tasks: BTreeMap<SourceId, Task>,
	next_id: u64,
	// The entry currently taken out for dispatch, and whether a removal
	// arrived for it while it was out.
	in_flight: Option<SourceId>,
	in_flight_dead: bool,
}

impl Inner {
	fn allocate_id(&mut self) -> SourceId {
		self.next_id += 1;
		SourceId(self.next_id)
	}
}

/// Cloneable registration handle onto a [`Reactor`].
#[derive(Clone)]
pub struct LoopHandle {
	inner: Rc<RefCell<Inner>>,
}

impl LoopHandle {
	/// Registers an I/O source watching `fd` for readable/error/hangup.
	pub fn add_io_source(
		&self,
		name: &'static str,
		fd: RawFd,
		priority: i32,
		source: Box<dyn IoSource>,
	) -> SourceId {
		let mut inner = self.inner.borrow_mut();
		let id = inner.allocate_id();
		inner.tasks.insert(
			id,
			Task {
				name,
				priority,
				kind: TaskKind::Io {
					fd,
					revents: 0,
					source,
				},
			},
		);
		trace!(name, fd, priority, "io source attached");
		id
	}

	/// Registers a deferred source and returns its trigger.
	pub fn add_deferred_source(
		&self,
		name: &'static str,
		priority: i32,
		callback: Box<dyn FnMut()>,
	) -> (SourceId, Trigger) {
		let trigger = Trigger::new();
		let mut inner = self.inner.borrow_mut();
		let id = inner.allocate_id();
		inner.tasks.insert(
			id,
			Task {
				name,
				priority,
				kind: TaskKind::Deferred {
					trigger: trigger.clone(),
					callback,
				},
			},
		);
		trace!(name, priority, "deferred source attached");
		(id, trigger)
	}

	/// Detaches a source. Safe to call from inside a dispatch callback,
	/// including the source's own.
	pub fn remove_source(&self, id: SourceId) -> bool {
		let mut inner = self.inner.borrow_mut();
		if inner.tasks.remove(&id).is_some() {
			return true;
		}
		if inner.in_flight == Some(id) {
			inner.in_flight_dead = true;
			return true;
		}
		false
	}

	/// Returns `true` when both handles drive the same loop.
	pub fn same_loop(&self, other: &Self) -> bool {
		Rc::ptr_eq(&self.inner, &other.inner)
	}

	/// Number of currently attached sources.
	pub fn source_count(&self) -> usize {
		let inner = self.inner.borrow();
		inner.tasks.len() + usize::from(inner.in_flight.is_some() && !inner.in_flight_dead)
	}
}

/// The reactor itself; owned and driven by the host.
pub struct Reactor {
	inner: Rc<RefCell<Inner>>,
}

impl Reactor {
	/// Creates an empty reactor.
	pub fn new() -> Self {
		Self {
			inner: Rc::new(RefCell::new(Inner::default())),
		}
	}

	/// Returns a handle components use to attach and detach sources.
	pub fn handle(&self) -> LoopHandle {
		LoopHandle {
			inner: Rc::clone(&self.inner),
		}
	}

	/// Runs one turn: prepare, poll, then dispatch the runnable snapshot in
	/// priority order (smaller numbers first; ties by registration order).
	///
	/// `timeout` bounds the poll wait; `None` waits indefinitely. The wait is
	/// skipped entirely when a trigger is already marked, and a turn with
	/// nothing to wait on returns immediately rather than parking forever.
	/// Returns the number of sources dispatched.
	pub fn turn(&self, timeout: Option<Duration>) -> Result<usize, LoopError> {
		self.prepare_io_sources();

		let (poll_ids, mut pollfds) = self.collect_pollfds();
		let deferred_ready = self.any_marked_trigger();
		let timeout_ms = if deferred_ready {
			0
		} else {
			timeout.map_or(-1, |t| t.as_millis().min(i32::MAX as u128) as i32)
		};
		if pollfds.is_empty() && timeout_ms < 0 {
			return Ok(0);
		}

		let rc = unsafe {
			libc::poll(
				pollfds.as_mut_ptr(),
				pollfds.len() as libc::nfds_t,
				timeout_ms,
			)
		};
		if rc < 0 {
			let err = std::io::Error::last_os_error();
			if err.kind() == std::io::ErrorKind::Interrupted {
				return Ok(0);
			}
			return Err(LoopError::Poll(err));
		}

		{
			let mut inner = self.inner.borrow_mut();
			for (id, pfd) in poll_ids.iter().zip(pollfds.iter()) {
				if let Some(task) = inner.tasks.get_mut(id)
					&& let TaskKind::Io { revents, .. } = &mut task.kind
				{
					*revents = pfd.revents;
				}
			}
		}

		// Snapshot the runnable set before dispatching anything: marks made
		// by an I/O dispatch below land on the next turn.
		let mut runnable: Vec<(i32, SourceId)> = {
			let inner = self.inner.borrow();
			inner
				.tasks
				.iter()
				.filter_map(|(id, task)| match &task.kind {
					TaskKind::Io { revents, .. } if *revents != 0 => Some((task.priority, *id)),
					TaskKind::Deferred { trigger, .. } if trigger.is_marked() => {
						Some((task.priority, *id))
					}
					_ => None,
				})
				.collect()
		};
		runnable.sort_unstable();

		let mut dispatched = 0;
		for (_, id) in runnable {
			dispatched += self.dispatch_one(id);
		}
		Ok(dispatched)
	}

	fn prepare_io_sources(&self) {
		let mut io_ids: Vec<(i32, SourceId)> = {
			let inner = self.inner.borrow();
			inner
				.tasks
				.iter()
				.filter(|(_, task)| matches!(task.kind, TaskKind::Io { .. }))
				.map(|(id, task)| (task.priority, *id))
				.collect()
		};
		io_ids.sort_unstable();
		for (_, id) in io_ids {
			self.with_task(id, |task| {
				if let TaskKind::Io { source, .. } = &mut task.kind {
					source.prepare();
				}
				(0, true)
			});
		}
	}

	fn collect_pollfds(&self) -> (Vec<SourceId>, Vec<libc::pollfd>) {
		let inner = self.inner.borrow();
		let mut ids = Vec::new();
		let mut pollfds = Vec::new();
		for (id, task) in &inner.tasks {
			if let TaskKind::Io { fd, .. } = &task.kind {
				ids.push(*id);
				pollfds.push(libc::pollfd {
					fd: *fd,
					events: libc::POLLIN | libc::POLLERR | libc::POLLHUP,
					revents: 0,
				});
			}
		}
		(ids, pollfds)
	}

	fn any_marked_trigger(&self) -> bool {
		self.inner.borrow().tasks.values().any(|task| {
			matches!(&task.kind, TaskKind::Deferred { trigger, .. } if trigger.is_marked())
		})
	}

	fn dispatch_one(&self, id: SourceId) -> usize {
		self.with_task(id, |task| match &mut task.kind {
			TaskKind::Io {
				source, revents, ..
			} => {
				let ready = Readiness::from_revents(*revents);
				*revents = 0;
				match source.dispatch(ready) {
					Directive::Continue => (1, true),
					Directive::Remove => {
						trace!(name = task.name, "io source detached by dispatch");
						(1, false)
					}
				}
			}
			TaskKind::Deferred { trigger, callback } => {
				// Clear before running so a re-mark schedules the next turn.
				if trigger.take() {
					callback();
					(1, true)
				} else {
					(0, true)
				}
			}
		})
	}

	// Takes the task out of the table, runs `f` without holding the borrow
	// (dispatch callbacks may attach or detach sources), then puts it back
	// unless `f` or a concurrent removal said otherwise.
	fn with_task(&self, id: SourceId, f: impl FnOnce(&mut Task) -> (usize, bool)) -> usize {
		let mut task = {
			let mut inner = self.inner.borrow_mut();
			let Some(task) = inner.tasks.remove(&id) else {
				return 0;
			};
			inner.in_flight = Some(id);
			inner.in_flight_dead = false;
			task
		};
		let (ran, keep) = f(&mut task);
		let mut inner = self.inner.borrow_mut();
		let dead = std::mem::replace(&mut inner.in_flight_dead, false);
		inner.in_flight = None;
		if keep && !dead {
			inner.tasks.insert(id, task);
		}
		ran
	}
}

impl Default for Reactor {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use std::cell::{Cell, RefCell};
	use std::io::{Read, Write};
	use std::os::fd::AsRawFd;
	use std::os::unix::net::UnixStream;
	use std::rc::Rc;
	use std::time::Duration;

	use super::{Directive, IoSource, PRIORITY_DEFAULT, Reactor, Readiness};

	const ZERO: Option<Duration> = Some(Duration::ZERO);

	struct RecordingSource {
		stream: UnixStream,
		prepares: Rc<Cell<u32>>,
		dispatches: Rc<Cell<u32>>,
		log: Option<Rc<RefCell<Vec<&'static str>>>>,
	}

	impl RecordingSource {
		fn new(stream: UnixStream) -> Self {
			stream.set_nonblocking(true).expect("nonblocking");
			Self {
				stream,
				prepares: Rc::new(Cell::new(0)),
				dispatches: Rc::new(Cell::new(0)),
				log: None,
			}
		}
	}

	impl IoSource for RecordingSource {
		fn prepare(&mut self) {
			self.prepares.set(self.prepares.get() + 1);
		}

		fn dispatch(&mut self, ready: Readiness) -> Directive {
			self.dispatches.set(self.dispatches.get() + 1);
			if let Some(log) = &self.log {
				log.borrow_mut().push("io");
			}
			if ready.readable {
				let mut buf = [0u8; 64];
				let _ = self.stream.read(&mut buf);
			}
			if ready.error || ready.hangup {
				return Directive::Remove;
			}
			Directive::Continue
		}
	}

	#[test]
	fn io_source_dispatches_when_readable() {
		let reactor = Reactor::new();
		let (ours, mut theirs) = UnixStream::pair().expect("socketpair");
		let source = RecordingSource::new(ours);
		let dispatches = Rc::clone(&source.dispatches);
		let fd = source.stream.as_raw_fd();
		reactor
			.handle()
			.add_io_source("test-io", fd, PRIORITY_DEFAULT, Box::new(source));

		assert_eq!(reactor.turn(ZERO).expect("turn"), 0);
		assert_eq!(dispatches.get(), 0);

		theirs.write_all(b"x").expect("write");
		assert_eq!(reactor.turn(ZERO).expect("turn"), 1);
		assert_eq!(dispatches.get(), 1);
	}

	#[test]
	fn prepare_runs_every_turn_even_when_idle() {
		let reactor = Reactor::new();
		let (ours, _theirs) = UnixStream::pair().expect("socketpair");
		let source = RecordingSource::new(ours);
		let prepares = Rc::clone(&source.prepares);
		let fd = source.stream.as_raw_fd();
		reactor
			.handle()
			.add_io_source("test-io", fd, PRIORITY_DEFAULT, Box::new(source));

		reactor.turn(ZERO).expect("turn");
		reactor.turn(ZERO).expect("turn");
		assert_eq!(prepares.get(), 2);
	}

	#[test]
	fn hangup_detaches_the_source() {
		let reactor = Reactor::new();
		let handle = reactor.handle();
		let (ours, theirs) = UnixStream::pair().expect("socketpair");
		let source = RecordingSource::new(ours);
		let dispatches = Rc::clone(&source.dispatches);
		let fd = source.stream.as_raw_fd();
		handle.add_io_source("test-io", fd, PRIORITY_DEFAULT, Box::new(source));

		drop(theirs);
		assert_eq!(reactor.turn(ZERO).expect("turn"), 1);
		assert_eq!(dispatches.get(), 1);
		assert_eq!(handle.source_count(), 0);

		// Nothing left to dispatch on later turns.
		assert_eq!(reactor.turn(ZERO).expect("turn"), 0);
		assert_eq!(dispatches.get(), 1);
	}

	#[test]
	fn trigger_marks_coalesce_into_one_dispatch() {
		let reactor = Reactor::new();
		let runs = Rc::new(Cell::new(0u32));
		let counter = Rc::clone(&runs);
		let (_id, trigger) = reactor.handle().add_deferred_source(
			"test-deferred",
			PRIORITY_DEFAULT,
			Box::new(move || counter.set(counter.get() + 1)),
		);

		trigger.mark();
		trigger.mark();
		trigger.mark();
		assert_eq!(reactor.turn(ZERO).expect("turn"), 1);
		assert_eq!(runs.get(), 1);

		// Disarmed until marked again.
		assert_eq!(reactor.turn(ZERO).expect("turn"), 0);
		assert_eq!(runs.get(), 1);

		trigger.mark();
		assert_eq!(reactor.turn(ZERO).expect("turn"), 1);
		assert_eq!(runs.get(), 2);
	}

	#[test]
	fn mark_made_during_dispatch_runs_next_turn() {
		let reactor = Reactor::new();
		let runs = Rc::new(Cell::new(0u32));
		let counter = Rc::clone(&runs);
		let trigger_slot: Rc<RefCell<Option<super::Trigger>>> = Rc::new(RefCell::new(None));
		let slot = Rc::clone(&trigger_slot);
		let (_id, trigger) = reactor.handle().add_deferred_source(
			"test-deferred",
			PRIORITY_DEFAULT,
			Box::new(move || {
				counter.set(counter.get() + 1);
				if counter.get() == 1
					&& let Some(trigger) = &*slot.borrow()
				{
					trigger.mark();
				}
			}),
		);
		*trigger_slot.borrow_mut() = Some(trigger.clone());

		trigger.mark();
		assert_eq!(reactor.turn(ZERO).expect("turn"), 1);
		assert_eq!(runs.get(), 1);
		assert_eq!(reactor.turn(ZERO).expect("turn"), 1);
		assert_eq!(runs.get(), 2);
		assert_eq!(reactor.turn(ZERO).expect("turn"), 0);
		assert_eq!(runs.get(), 2);
	}

	#[test]
	fn io_mark_defers_notification_to_the_next_turn() {
		let reactor = Reactor::new();
		let runs = Rc::new(Cell::new(0u32));
		let counter = Rc::clone(&runs);
		let (_id, trigger) = reactor.handle().add_deferred_source(
			"test-deferred",
			PRIORITY_DEFAULT,
			Box::new(move || counter.set(counter.get() + 1)),
		);

		struct MarkingSource {
			stream: UnixStream,
			trigger: super::Trigger,
		}
		impl IoSource for MarkingSource {
			fn dispatch(&mut self, ready: Readiness) -> Directive {
				if ready.readable {
					let mut buf = [0u8; 8];
					let _ = self.stream.read(&mut buf);
					self.trigger.mark();
				}
				Directive::Continue
			}
		}

		let (ours, mut theirs) = UnixStream::pair().expect("socketpair");
		ours.set_nonblocking(true).expect("nonblocking");
		let fd = ours.as_raw_fd();
		reactor.handle().add_io_source(
			"test-io",
			fd,
			PRIORITY_DEFAULT,
			Box::new(MarkingSource {
				stream: ours,
				trigger,
			}),
		);

		theirs.write_all(b"frame").expect("write");
		// First turn: the io source observes the event and marks the trigger;
		// the deferred callback must not run yet.
		assert_eq!(reactor.turn(ZERO).expect("turn"), 1);
		assert_eq!(runs.get(), 0);
		// Second turn: the deferred callback fires exactly once.
		assert_eq!(reactor.turn(ZERO).expect("turn"), 1);
		assert_eq!(runs.get(), 1);
	}

	#[test]
	fn stricter_priority_dispatches_first() {
		let reactor = Reactor::new();
		let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

		let deferred_log = Rc::clone(&log);
		let (_id, trigger) = reactor.handle().add_deferred_source(
			"test-deferred",
			110,
			Box::new(move || deferred_log.borrow_mut().push("deferred")),
		);
		trigger.mark();

		let (ours, mut theirs) = UnixStream::pair().expect("socketpair");
		let mut source = RecordingSource::new(ours);
		source.log = Some(Rc::clone(&log));
		let fd = source.stream.as_raw_fd();
		reactor
			.handle()
			.add_io_source("test-io", fd, 100, Box::new(source));

		theirs.write_all(b"x").expect("write");
		assert_eq!(reactor.turn(ZERO).expect("turn"), 2);
		assert_eq!(*log.borrow(), vec!["io", "deferred"]);
	}

	#[test]
	fn source_can_remove_itself_from_dispatch() {
		let reactor = Reactor::new();
		let handle = reactor.handle();
		let runs = Rc::new(Cell::new(0u32));
		let counter = Rc::clone(&runs);
		let id_slot: Rc<RefCell<Option<super::SourceId>>> = Rc::new(RefCell::new(None));
		let slot = Rc::clone(&id_slot);
		let remover = handle.clone();
		let (id, trigger) = handle.add_deferred_source(
			"test-deferred",
			PRIORITY_DEFAULT,
			Box::new(move || {
				counter.set(counter.get() + 1);
				if let Some(id) = *slot.borrow() {
					assert!(remover.remove_source(id));
				}
			}),
		);
		*id_slot.borrow_mut() = Some(id);

		trigger.mark();
		assert_eq!(reactor.turn(ZERO).expect("turn"), 1);
		assert_eq!(runs.get(), 1);
		assert_eq!(handle.source_count(), 0);

		// A stale mark on a removed source never fires.
		trigger.mark();
		assert_eq!(reactor.turn(ZERO).expect("turn"), 0);
		assert_eq!(runs.get(), 1);
	}

	#[test]
	fn turn_without_sources_returns_immediately() {
		let reactor = Reactor::new();
		assert_eq!(reactor.turn(None).expect("turn"), 0);
	}
}
