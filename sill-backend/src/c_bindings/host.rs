//! Host interface: loop lifecycle and the process frame-complete sink.

use std::cell::{Cell, RefCell};
use std::ffi::c_void;
use std::time::Duration;

use sill_loop::{LoopHandle, Reactor};
use tracing::warn;

use crate::display::DisplayBroker;

/// Host frame-complete sink, invoked with the completing target's token.
pub type FrameCompleteFn = unsafe extern "C" fn(token: *mut c_void);

thread_local! {
	static CURRENT_LOOP: RefCell<Option<LoopHandle>> = const { RefCell::new(None) };
	static BROKER: DisplayBroker = DisplayBroker::new();
	static FRAME_HANDLER: Cell<Option<FrameCompleteFn>> = const { Cell::new(None) };
}

/// The loop made current on this thread, if any. Backends and targets
/// created through the C tables attach their sources to it.
pub(crate) fn current_loop() -> Option<LoopHandle> {
	CURRENT_LOOP.with(|slot| slot.borrow().clone())
}

/// Runs `f` against this thread's display broker.
pub(crate) fn with_broker<R>(f: impl FnOnce(&DisplayBroker) -> R) -> R {
	BROKER.with(f)
}

/// Delivers a frame completion to the registered host sink.
pub(crate) fn host_frame_complete(token: usize) {
	if let Some(handler) = FRAME_HANDLER.with(Cell::get) {
		unsafe { handler(token as *mut c_void) };
	}
}

/// Opaque loop object owned and iterated by the host.
pub struct SillLoop {
	reactor: Reactor,
}

unsafe extern "C" fn loop_create() -> *mut SillLoop {
	Box::into_raw(Box::new(SillLoop {
		reactor: Reactor::new(),
	}))
}

unsafe extern "C" fn loop_destroy(sill_loop: *mut SillLoop) {
	if sill_loop.is_null() {
		return;
	}
	let sill_loop = unsafe { Box::from_raw(sill_loop) };
	CURRENT_LOOP.with(|slot| {
		let mut slot = slot.borrow_mut();
		if slot
			.as_ref()
			.is_some_and(|current| current.same_loop(&sill_loop.reactor.handle()))
		{
			*slot = None;
		}
	});
}

/// Makes `sill_loop` the loop new backends and targets on this thread attach
/// to; null clears it.
unsafe extern "C" fn loop_make_current(sill_loop: *mut SillLoop) {
	let handle = unsafe { sill_loop.as_ref() }.map(|sill_loop| sill_loop.reactor.handle());
	CURRENT_LOOP.with(|slot| *slot.borrow_mut() = handle);
}

/// Runs one loop turn. A negative timeout waits indefinitely. Returns the
/// number of sources dispatched.
unsafe extern "C" fn loop_iterate(sill_loop: *mut SillLoop, timeout_ms: i32) -> u32 {
	let Some(sill_loop) = (unsafe { sill_loop.as_ref() }) else {
		return 0;
	};
	let timeout = (timeout_ms >= 0).then(|| Duration::from_millis(timeout_ms as u64));
	match sill_loop.reactor.turn(timeout) {
		Ok(dispatched) => dispatched as u32,
		Err(err) => {
			warn!("loop iteration failed: {err}");
			0
		}
	}
}

unsafe extern "C" fn set_frame_complete_handler(handler: Option<FrameCompleteFn>) {
	FRAME_HANDLER.with(|slot| slot.set(handler));
}

/// Host-side function table.
#[repr(C)]
pub struct SillRendererHostInterface {
	pub create_loop: unsafe extern "C" fn() -> *mut SillLoop,
	pub destroy_loop: unsafe extern "C" fn(*mut SillLoop),
	pub make_loop_current: unsafe extern "C" fn(*mut SillLoop),
	pub iterate_loop: unsafe extern "C" fn(*mut SillLoop, i32) -> u32,
	pub set_frame_complete_handler: unsafe extern "C" fn(Option<FrameCompleteFn>),
}

pub static SILL_RENDERER_HOST_INTERFACE: SillRendererHostInterface = SillRendererHostInterface {
	create_loop: loop_create,
	destroy_loop: loop_destroy,
	make_loop_current: loop_make_current,
	iterate_loop: loop_iterate,
	set_frame_complete_handler,
};
