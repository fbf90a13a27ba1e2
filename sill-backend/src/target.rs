//! Per-surface render-target core shared by both backend flavors.
//!
//! A target moves Bound → Initialized once its drawable exists, bounces
//! Initialized ⇄ Armed around each frame, and is Destroyed on drop. The
//! frame-completion path is two-hop: the server's one-shot callback only
//! disarms the pacer and marks a deferred source; the host-visible
//! notification runs from that source on a later loop turn, outside display
//! message processing.

use std::cell::RefCell;
use std::os::fd::OwnedFd;
use std::rc::Rc;

use sill_loop::{LoopHandle, SourceId, Trigger};
use sill_protocol::{ControlChannel, ControlMessage};
use tracing::{debug, trace, warn};
use wayland_client::Proxy;
use wayland_client::protocol::wl_surface::WlSurface;

use crate::display::{DisplayHandle, FRAME_SOURCE_PRIORITY};
use crate::error::BackendError;

/// Capability the target core needs from a backend, implemented by both the
/// raster-style and explicit-API flavors.
pub trait RendererBackend {
	/// Shared display connection, when established.
	fn display(&self) -> Option<&DisplayHandle>;

	/// Whether the backend's GPU instance came up.
	fn has_gpu_instance(&self) -> bool;
}

/// Armed/idle frame state for one surface.
pub(crate) struct FramePacer {
	armed: bool,
	trigger: Trigger,
}

impl FramePacer {
	pub(crate) fn new(trigger: Trigger) -> Self {
		Self {
			armed: false,
			trigger,
		}
	}

	/// Arms the pacer; returns `true` when a fresh server callback must be
	/// requested. Arming while armed is a no-op, so at most one callback is
	/// live per cycle.
	pub(crate) fn arm(&mut self) -> bool {
		if self.armed {
			return false;
		}
		self.armed = true;
		true
	}

	/// Server observed the frame: disarm and schedule the deferred host
	/// notification. Ignored while idle, so the notification fires at most
	/// once per armed period.
	pub(crate) fn complete(&mut self) {
		if self.armed {
			self.armed = false;
			self.trigger.mark();
		}
	}

	pub(crate) fn is_armed(&self) -> bool {
		self.armed
	}
}

type FrameListener = Rc<RefCell<Option<Box<dyn FnMut()>>>>;

/// Deferred source delivering host-visible frame completions.
///
/// Detaches itself from the loop on drop.
pub(crate) struct FrameNotifier {
	loop_handle: LoopHandle,
	source: SourceId,
	trigger: Trigger,
}

impl FrameNotifier {
	pub(crate) fn attach(loop_handle: &LoopHandle, listener: FrameListener) -> Self {
		let callback = Box::new(move || {
			// Run with the slot empty so the listener may re-install or
			// replace itself without tripping the borrow.
			let taken = listener.borrow_mut().take();
			if let Some(mut callback) = taken {
				callback();
				let mut slot = listener.borrow_mut();
				if slot.is_none() {
					*slot = Some(callback);
				}
			}
		});
		let (source, trigger) =
			loop_handle.add_deferred_source("sill-frame", FRAME_SOURCE_PRIORITY, callback);
		Self {
			loop_handle: loop_handle.clone(),
			source,
			trigger,
		}
	}

	pub(crate) fn trigger(&self) -> Trigger {
		self.trigger.clone()
	}
}

impl Drop for FrameNotifier {
	fn drop(&mut self) {
		self.loop_handle.remove_source(self.source);
	}
}

struct LiveSurface {
	display: DisplayHandle,
	surface: WlSurface,
	surface_id: u32,
	pacer: Rc<RefCell<FramePacer>>,
	_notifier: FrameNotifier,
}

impl Drop for LiveSurface {
	fn drop(&mut self) {
		self.display.unregister_pacer(self.surface_id);
		self.surface.destroy();
	}
}

/// State machine core of a render target.
pub(crate) struct TargetCore {
	control: Option<ControlChannel>,
	listener: FrameListener,
	live: Option<LiveSurface>,
}

impl TargetCore {
	/// Bound state: control socket attached, no drawable yet. An unusable
	/// control fd only costs the announcement, which is best-effort anyway.
	pub(crate) fn new(fd: OwnedFd) -> Self {
		let control = match ControlChannel::from_fd(fd) {
			Ok(channel) => Some(channel),
			Err(err) => {
				warn!("control channel unusable: {err}");
				None
			}
		};
		Self {
			control,
			listener: Rc::new(RefCell::new(None)),
			live: None,
		}
	}

	pub(crate) fn set_frame_complete_listener(&self, callback: Box<dyn FnMut()>) {
		*self.listener.borrow_mut() = Some(callback);
	}

	/// First half of Bound → Initialized: verifies the backend preconditions,
	/// attaches the deferred frame source to `loop_handle` and creates the
	/// compositing surface. The flavor builds its drawable against the
	/// returned surface, then finishes with [`Self::commit_initialize`] or
	/// rolls back with [`Self::abort_initialize`].
	pub(crate) fn begin_initialize(
		&mut self,
		backend: &dyn RendererBackend,
		loop_handle: &LoopHandle,
	) -> Result<WlSurface, BackendError> {
		if self.live.is_some() {
			return Err(BackendError::AlreadyInitialized);
		}
		let display = backend.display().ok_or(BackendError::NoConnection)?;
		if !backend.has_gpu_instance() {
			return Err(BackendError::NoGpuInstance);
		}
		let compositor = display.compositor().ok_or(BackendError::CompositorUnbound)?;

		let notifier = FrameNotifier::attach(loop_handle, Rc::clone(&self.listener));
		let surface = compositor.create_surface(&display.queue_handle(), ());
		let surface_id = surface.id().protocol_id();
		let pacer = Rc::new(RefCell::new(FramePacer::new(notifier.trigger())));
		display.register_pacer(surface_id, Rc::clone(&pacer));
		self.live = Some(LiveSurface {
			display: display.clone(),
			surface: surface.clone(),
			surface_id,
			pacer,
			_notifier: notifier,
		});
		Ok(surface)
	}

	/// Second half: one round-trip so the server has processed surface
	/// creation, then the exactly-once drawable announcement.
	pub(crate) fn commit_initialize(&mut self) -> Result<(), BackendError> {
		let live = self.live.as_ref().ok_or(BackendError::NotInitialized)?;
		live.display.roundtrip()?;
		announce_surface(self.control.as_ref(), live.surface_id);
		debug!(surface_id = live.surface_id, "render target initialized");
		Ok(())
	}

	/// Rolls a half-finished initialize back to Bound.
	pub(crate) fn abort_initialize(&mut self) {
		self.live = None;
	}

	/// Initialized → Armed: registers a fresh one-shot frame callback unless
	/// one is already pending.
	pub(crate) fn frame_will_render(&mut self) -> Result<(), BackendError> {
		let live = self.live.as_ref().ok_or(BackendError::NotInitialized)?;
		if live.pacer.borrow_mut().arm() {
			live.display.request_frame_callback(&live.surface);
			trace!(surface_id = live.surface_id, "frame callback armed");
		}
		Ok(())
	}

	pub(crate) fn is_initialized(&self) -> bool {
		self.live.is_some()
	}

	pub(crate) fn is_armed(&self) -> bool {
		self.live
			.as_ref()
			.is_some_and(|live| live.pacer.borrow().is_armed())
	}

	pub(crate) fn surface_id(&self) -> Option<u32> {
		self.live.as_ref().map(|live| live.surface_id)
	}
}

/// Sends the two-word surface-ready record, attempt-once; failures are
/// logged and dropped (no retry, no backpressure).
pub(crate) fn announce_surface(control: Option<&ControlChannel>, surface_id: u32) {
	let Some(channel) = control else {
		return;
	};
	if let Err(err) = channel.send(&ControlMessage::surface_ready(surface_id)) {
		debug!("surface announcement dropped: {err}");
	}
}

#[cfg(test)]
mod tests {
	use std::cell::{Cell, RefCell};
	use std::io::Read;
	use std::os::fd::OwnedFd;
	use std::os::unix::net::UnixStream;
	use std::rc::Rc;
	use std::time::Duration;

	use sill_loop::{Reactor, Trigger};
	use sill_protocol::{ControlChannel, ControlMessage, MESSAGE_SIZE, SURFACE_READY};

	use super::{FrameNotifier, FramePacer, announce_surface};

	const ZERO: Option<Duration> = Some(Duration::ZERO);

	#[test]
	fn pacer_arms_once_per_cycle() {
		let mut pacer = FramePacer::new(Trigger::new());
		assert!(pacer.arm());
		assert!(pacer.is_armed());
		// Arming while armed must not request another server callback.
		assert!(!pacer.arm());
		pacer.complete();
		assert!(!pacer.is_armed());
		assert!(pacer.arm());
	}

	#[test]
	fn completion_marks_the_trigger_at_most_once_per_armed_period() {
		let trigger = Trigger::new();
		let mut pacer = FramePacer::new(trigger.clone());

		// Idle completions are spurious and ignored.
		pacer.complete();
		assert!(!trigger.is_marked());

		assert!(pacer.arm());
		pacer.complete();
		assert!(trigger.is_marked());
	}

	#[test]
	fn frame_completion_reaches_the_host_on_a_later_turn() {
		let reactor = Reactor::new();
		let fired = Rc::new(Cell::new(0u32));
		let listener: Rc<RefCell<Option<Box<dyn FnMut()>>>> = Rc::new(RefCell::new(None));
		let notifier = FrameNotifier::attach(&reactor.handle(), Rc::clone(&listener));
		{
			let fired = Rc::clone(&fired);
			*listener.borrow_mut() = Some(Box::new(move || fired.set(fired.get() + 1)));
		}
		let mut pacer = FramePacer::new(notifier.trigger());

		// Armed, then the simulated server completion arrives.
		assert!(pacer.arm());
		pacer.complete();
		assert_eq!(fired.get(), 0);
		assert_eq!(reactor.turn(ZERO).expect("turn"), 1);
		assert_eq!(fired.get(), 1);

		// One notification per armed period, nothing more.
		assert_eq!(reactor.turn(ZERO).expect("turn"), 0);
		assert_eq!(fired.get(), 1);

		// Re-armable: the next cycle delivers again.
		assert!(pacer.arm());
		pacer.complete();
		assert_eq!(reactor.turn(ZERO).expect("turn"), 1);
		assert_eq!(fired.get(), 2);
	}

	#[test]
	fn notifier_detaches_its_source_on_drop() {
		let reactor = Reactor::new();
		let handle = reactor.handle();
		let listener: Rc<RefCell<Option<Box<dyn FnMut()>>>> = Rc::new(RefCell::new(None));
		let notifier = FrameNotifier::attach(&handle, Rc::clone(&listener));
		assert_eq!(handle.source_count(), 1);

		let trigger = notifier.trigger();
		drop(notifier);
		assert_eq!(handle.source_count(), 0);

		// A stale mark after detach never reaches a callback.
		trigger.mark();
		assert_eq!(reactor.turn(ZERO).expect("turn"), 0);
	}

	#[test]
	fn listener_may_rearm_from_inside_the_notification() {
		let reactor = Reactor::new();
		let fired = Rc::new(Cell::new(0u32));
		let listener: Rc<RefCell<Option<Box<dyn FnMut()>>>> = Rc::new(RefCell::new(None));
		let notifier = FrameNotifier::attach(&reactor.handle(), Rc::clone(&listener));
		let pacer = Rc::new(RefCell::new(FramePacer::new(notifier.trigger())));
		{
			let fired = Rc::clone(&fired);
			let pacer = Rc::clone(&pacer);
			*listener.borrow_mut() = Some(Box::new(move || {
				fired.set(fired.get() + 1);
				// Hosts commonly arm the next frame from the completion
				// callback; the pacer and listener slot must tolerate it.
				assert!(pacer.borrow_mut().arm());
			}));
		}

		assert!(pacer.borrow_mut().arm());
		pacer.borrow_mut().complete();
		assert_eq!(reactor.turn(ZERO).expect("turn"), 1);
		assert_eq!(fired.get(), 1);
		assert!(pacer.borrow().is_armed());
	}

	#[test]
	fn announce_writes_one_record() {
		let (ours, mut host) = UnixStream::pair().expect("socketpair");
		let channel = ControlChannel::from_fd(OwnedFd::from(ours)).expect("channel");
		announce_surface(Some(&channel), 7);

		let mut bytes = [0u8; MESSAGE_SIZE];
		host.read_exact(&mut bytes).expect("read");
		let message = ControlMessage::decode(&bytes).expect("decode");
		assert_eq!(message.opcode, SURFACE_READY);
		assert_eq!(message.surface_id, 7);

		// Nothing else was written.
		host.set_nonblocking(true).expect("nonblocking");
		let mut extra = [0u8; 1];
		assert!(host.read(&mut extra).is_err());
	}

	#[test]
	fn announce_to_dead_peer_is_swallowed() {
		let (ours, host) = UnixStream::pair().expect("socketpair");
		drop(host);
		let channel = ControlChannel::from_fd(OwnedFd::from(ours)).expect("channel");
		// Must neither panic nor signal; the failure is logged and dropped.
		announce_surface(Some(&channel), 9);
		announce_surface(None, 9);
	}
}
