//! Shared display-server connection and its loop integration.
//!
//! One process holds at most one live connection. Backends acquire it through
//! a [`DisplayBroker`]; every acquisition returns a refcounted
//! [`DisplayHandle`] onto the same connection, and the connection (plus its
//! I/O source) is torn down when the last handle drops.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::c_void;
use std::io::ErrorKind;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::rc::{Rc, Weak};

use sill_loop::{Directive, IoSource, LoopHandle, Readiness, SourceId};
use tracing::{debug, trace, warn};
use wayland_client::backend::{ReadEventsGuard, WaylandError};
use wayland_client::globals::{GlobalListContents, registry_queue_init};
use wayland_client::protocol::wl_callback::{self, WlCallback};
use wayland_client::protocol::wl_compositor::WlCompositor;
use wayland_client::protocol::wl_registry::WlRegistry;
use wayland_client::protocol::wl_surface::WlSurface;
use wayland_client::{Connection, Dispatch, EventQueue, Proxy, QueueHandle};

use crate::error::BackendError;
use crate::target::FramePacer;

/// Priority of the display fd source: after normal application work, before
/// idle, and stricter than [`FRAME_SOURCE_PRIORITY`] so server messages are
/// drained before per-target frame notifications run.
pub const DISPLAY_SOURCE_PRIORITY: i32 = 100;

/// Priority of per-target deferred frame sources.
pub const FRAME_SOURCE_PRIORITY: i32 = 110;

/// Protocol-side state: bound globals plus the per-surface frame pacers that
/// one-shot frame callbacks resolve against.
pub(crate) struct DisplayState {
	compositor: Option<WlCompositor>,
	pacers: HashMap<u32, Rc<RefCell<FramePacer>>>,
}

impl Dispatch<WlRegistry, GlobalListContents> for DisplayState {
	fn event(
		_state: &mut Self,
		_proxy: &WlRegistry,
		_event: wayland_client::protocol::wl_registry::Event,
		_data: &GlobalListContents,
		_conn: &Connection,
		_qh: &QueueHandle<Self>,
	) {
	}
}

impl Dispatch<WlCallback, u32> for DisplayState {
	fn event(
		state: &mut Self,
		_proxy: &WlCallback,
		event: wl_callback::Event,
		surface_id: &u32,
		_conn: &Connection,
		_qh: &QueueHandle<Self>,
	) {
		// Runs inside display-fd dispatch: only flip the pacer state, never
		// call back into the host from here. The callback object is one-shot
		// and dies with this event.
		if let wl_callback::Event::Done { .. } = event
			&& let Some(pacer) = state.pacers.get(surface_id)
		{
			pacer.borrow_mut().complete();
		}
	}
}

wayland_client::delegate_noop!(DisplayState: ignore WlCompositor);
wayland_client::delegate_noop!(DisplayState: ignore WlSurface);

struct ConnState {
	connection: Connection,
	queue: EventQueue<DisplayState>,
	qh: QueueHandle<DisplayState>,
	state: DisplayState,
	read_guard: Option<ReadEventsGuard>,
	loop_handle: LoopHandle,
	source: Option<SourceId>,
}

impl ConnState {
	fn establish(fd: OwnedFd, loop_handle: &LoopHandle) -> Result<Rc<RefCell<Self>>, BackendError> {
		let stream = UnixStream::from(fd);
		let connection = Connection::from_socket(stream)?;
		// One round-trip: all initial globals are bound before we return.
		let (globals, queue) = registry_queue_init::<DisplayState>(&connection)?;
		let qh = queue.handle();
		let compositor = match globals.bind::<WlCompositor, _, _>(&qh, 1..=4, ()) {
			Ok(compositor) => Some(compositor),
			Err(err) => {
				warn!("surface-compositing global unavailable: {err}");
				None
			}
		};

		let shared = Rc::new(RefCell::new(Self {
			connection,
			queue,
			qh,
			state: DisplayState {
				compositor,
				pacers: HashMap::new(),
			},
			read_guard: None,
			loop_handle: loop_handle.clone(),
			source: None,
		}));

		let fd = shared.borrow().connection.backend().poll_fd().as_raw_fd();
		let source = loop_handle.add_io_source(
			"sill-display",
			fd,
			DISPLAY_SOURCE_PRIORITY,
			Box::new(DisplaySource {
				conn: Rc::downgrade(&shared),
			}),
		);
		shared.borrow_mut().source = Some(source);
		debug!(fd, "display connection established");
		Ok(shared)
	}
}

impl Drop for ConnState {
	fn drop(&mut self) {
		if let Some(source) = self.source.take() {
			self.loop_handle.remove_source(source);
		}
		debug!("display connection closed");
	}
}

/// I/O source adapting the connection socket into the reactor.
///
/// Prepare flushes outgoing requests and opens a read guard before the host
/// blocks; dispatch completes the read and processes exactly one batch of
/// incoming messages. Error or hangup detaches the source for good.
struct DisplaySource {
	conn: Weak<RefCell<ConnState>>,
}

impl IoSource for DisplaySource {
	fn prepare(&mut self) {
		let Some(shared) = self.conn.upgrade() else {
			return;
		};
		let mut conn = shared.borrow_mut();
		let ConnState {
			queue,
			state,
			read_guard,
			..
		} = &mut *conn;
		*read_guard = None;
		loop {
			if let Err(err) = queue.dispatch_pending(state) {
				warn!("display dispatch failed: {err}");
				return;
			}
			if let Err(err) = queue.flush() {
				match err {
					WaylandError::Io(ref io) if io.kind() == ErrorKind::WouldBlock => {}
					other => {
						trace!("display flush: {other}");
					}
				}
			}
			// `None` means events were queued meanwhile; drain and retry.
			match queue.prepare_read() {
				Some(guard) => {
					*read_guard = Some(guard);
					return;
				}
				None => continue,
			}
		}
	}

	fn dispatch(&mut self, ready: Readiness) -> Directive {
		let Some(shared) = self.conn.upgrade() else {
			return Directive::Remove;
		};
		let mut conn = shared.borrow_mut();
		if ready.error || ready.hangup {
			warn!("display socket error or hangup, detaching");
			conn.read_guard = None;
			return Directive::Remove;
		}
		if ready.readable {
			if let Some(guard) = conn.read_guard.take() {
				match guard.read() {
					Ok(_) => {}
					Err(WaylandError::Io(ref io)) if io.kind() == ErrorKind::WouldBlock => {}
					Err(err) => {
						warn!("display read failed: {err}");
						return Directive::Remove;
					}
				}
			}
			let ConnState { queue, state, .. } = &mut *conn;
			if let Err(err) = queue.dispatch_pending(state) {
				warn!("display dispatch failed: {err}");
			}
		}
		Directive::Continue
	}
}

/// Hands out shared handles onto the process's display connection.
///
/// The broker itself owns nothing but the knowledge of whether a connection
/// is live; it is created by the embedder and passed down explicitly.
pub struct DisplayBroker {
	live: RefCell<Weak<RefCell<ConnState>>>,
}

impl DisplayBroker {
	/// Creates a broker with no live connection.
	pub fn new() -> Self {
		Self {
			live: RefCell::new(Weak::new()),
		}
	}

	/// Returns a handle to the live connection, or establishes one over `fd`.
	///
	/// When a connection already exists the passed fd is discarded (closed)
	/// and the existing connection keeps the fd it was established over;
	/// `loop_handle` is likewise ignored on reuse because the I/O source is
	/// already attached.
	pub fn connect(
		&self,
		fd: OwnedFd,
		loop_handle: &LoopHandle,
	) -> Result<DisplayHandle, BackendError> {
		if let Some(shared) = self.live.borrow().upgrade() {
			debug!("reusing live display connection, discarding fd");
			return Ok(DisplayHandle { shared });
		}
		let shared = ConnState::establish(fd, loop_handle)?;
		*self.live.borrow_mut() = Rc::downgrade(&shared);
		Ok(DisplayHandle { shared })
	}

	/// Returns a handle to the live connection without establishing one.
	///
	/// The returned handle owns a share like any other.
	pub fn current(&self) -> Option<DisplayHandle> {
		self.live
			.borrow()
			.upgrade()
			.map(|shared| DisplayHandle { shared })
	}

	/// Whether a connection is currently live.
	pub fn is_connected(&self) -> bool {
		self.live.borrow().strong_count() > 0
	}
}

impl Default for DisplayBroker {
	fn default() -> Self {
		Self::new()
	}
}

/// Shared-ownership handle onto the display connection.
///
/// Dropping a handle releases one share; the connection and its I/O source
/// are destroyed when the last share goes away.
#[derive(Clone)]
pub struct DisplayHandle {
	shared: Rc<RefCell<ConnState>>,
}

impl DisplayHandle {
	/// Raw `wl_display` pointer for GPU APIs that consume the native handle.
	pub fn display_ptr(&self) -> *mut c_void {
		self.shared.borrow().connection.backend().display_ptr().cast()
	}

	/// Returns `true` when the two handles share one connection.
	pub fn same_connection(&self, other: &Self) -> bool {
		Rc::ptr_eq(&self.shared, &other.shared)
	}

	/// Whether the surface-compositing global was bound.
	pub fn has_compositor(&self) -> bool {
		self.shared.borrow().state.compositor.is_some()
	}

	pub(crate) fn compositor(&self) -> Option<WlCompositor> {
		self.shared.borrow().state.compositor.clone()
	}

	pub(crate) fn queue_handle(&self) -> QueueHandle<DisplayState> {
		self.shared.borrow().qh.clone()
	}

	/// Blocks until the server has processed all requests sent so far.
	pub(crate) fn roundtrip(&self) -> Result<usize, BackendError> {
		let mut conn = self.shared.borrow_mut();
		let ConnState {
			queue,
			state,
			read_guard,
			..
		} = &mut *conn;
		// Cancel any read prepared for the next poll: the round-trip reads
		// the socket itself and would otherwise wait on that stale reader.
		*read_guard = None;
		Ok(queue.roundtrip(state)?)
	}

	pub(crate) fn register_pacer(&self, surface_id: u32, pacer: Rc<RefCell<FramePacer>>) {
		self.shared
			.borrow_mut()
			.state
			.pacers
			.insert(surface_id, pacer);
	}

	pub(crate) fn unregister_pacer(&self, surface_id: u32) {
		self.shared.borrow_mut().state.pacers.remove(&surface_id);
	}

	/// Requests a one-shot frame callback for `surface`, routed to the pacer
	/// registered under the surface's protocol id.
	pub(crate) fn request_frame_callback(&self, surface: &WlSurface) {
		let conn = self.shared.borrow();
		surface.frame(&conn.qh, surface.id().protocol_id());
	}
}
