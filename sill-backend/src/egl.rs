//! Raster-style backend: EGL over the shared display connection.

use std::env;
use std::ffi::c_void;
use std::os::fd::OwnedFd;
use std::ptr;

use khronos_egl as egl;
use sill_loop::LoopHandle;
use tracing::{debug, warn};
use wayland_client::Proxy;
use wayland_egl::WlEglSurface;

use crate::display::{DisplayBroker, DisplayHandle};
use crate::error::BackendError;
use crate::target::{RendererBackend, TargetCore};

type EglInstance = egl::DynamicInstance<egl::EGL1_4>;

/// Overrides the EGL library the backend loads (defaults to the system
/// `libEGL`).
const EGL_LIBRARY_ENV: &str = "SILL_EGL_LIBRARY";

struct EglStack {
	instance: EglInstance,
	display: egl::Display,
}

/// Process-wide raster GPU context bound to the shared display connection.
pub struct EglBackend {
	display: Option<DisplayHandle>,
	egl: Option<EglStack>,
}

impl EglBackend {
	/// Shares or establishes the display connection over `fd` and brings up
	/// EGL on it. Either failure is non-fatal here: the affected handle
	/// stays unset and target initialization fails downstream.
	pub fn new(broker: &DisplayBroker, loop_handle: &LoopHandle, fd: OwnedFd) -> Self {
		let display = match broker.connect(fd, loop_handle) {
			Ok(handle) => Some(handle),
			Err(err) => {
				warn!("display connection failed: {err}");
				None
			}
		};
		let egl = display.as_ref().and_then(|handle| match init_egl(handle) {
			Ok(stack) => Some(stack),
			Err(err) => {
				warn!("EGL initialization failed: {err}");
				None
			}
		});
		Self { display, egl }
	}

	/// Native display handle consumed by EGL clients; null when the
	/// connection failed.
	pub fn native_display(&self) -> *mut c_void {
		self.display
			.as_ref()
			.map_or(ptr::null_mut(), |display| display.display_ptr())
	}

	/// The initialized EGL display, when EGL came up.
	pub fn egl_display(&self) -> Option<egl::Display> {
		self.egl.as_ref().map(|stack| stack.display)
	}
}

impl RendererBackend for EglBackend {
	fn display(&self) -> Option<&DisplayHandle> {
		self.display.as_ref()
	}

	fn has_gpu_instance(&self) -> bool {
		self.egl.is_some()
	}
}

impl Drop for EglBackend {
	fn drop(&mut self) {
		if let Some(stack) = self.egl.take()
			&& let Err(err) = stack.instance.terminate(stack.display)
		{
			debug!("eglTerminate failed: {err}");
		}
	}
}

fn load_egl_instance() -> Result<EglInstance, BackendError> {
	if let Ok(path) = env::var(EGL_LIBRARY_ENV) {
		let library = unsafe { libloading::Library::new(&path) }
			.map_err(|err| BackendError::EglLoad(format!("{path}: {err}")))?;
		return unsafe { EglInstance::load_required_from(library) }
			.map_err(|err| BackendError::EglLoad(err.to_string()));
	}
	unsafe { EglInstance::load_required() }.map_err(|err| BackendError::EglLoad(err.to_string()))
}

fn init_egl(display: &DisplayHandle) -> Result<EglStack, BackendError> {
	let instance = load_egl_instance()?;
	let egl_display =
		unsafe { instance.get_display(display.display_ptr()) }.ok_or(BackendError::EglDisplay)?;
	let (major, minor) = instance
		.initialize(egl_display)
		.map_err(BackendError::EglInit)?;
	debug!(major, minor, "EGL display initialized");
	Ok(EglStack {
		instance,
		display: egl_display,
	})
}

/// Raster-style render target: a `wl_egl_window` drawable over a compositing
/// surface.
pub struct EglTarget {
	// Declared before `core` so the native window dies before the surface it
	// wraps.
	window: Option<WlEglSurface>,
	core: TargetCore,
}

impl EglTarget {
	/// Creates a Bound target over the host control socket.
	pub fn new(fd: OwnedFd) -> Self {
		Self {
			window: None,
			core: TargetCore::new(fd),
		}
	}

	/// Installs the host-visible frame-complete listener.
	pub fn on_frame_complete(&self, callback: impl FnMut() + 'static) {
		self.core.set_frame_complete_listener(Box::new(callback));
	}

	/// Creates the native drawable at the given dimensions and announces it
	/// to the host. The deferred frame source attaches to `loop_handle`.
	pub fn initialize(
		&mut self,
		backend: &EglBackend,
		loop_handle: &LoopHandle,
		width: u32,
		height: u32,
	) -> Result<(), BackendError> {
		let surface = self.core.begin_initialize(backend, loop_handle)?;
		let window = match WlEglSurface::new(surface.id(), width as i32, height as i32) {
			Ok(window) => window,
			Err(err) => {
				self.core.abort_initialize();
				return Err(BackendError::NativeWindow(err.to_string()));
			}
		};
		self.window = Some(window);
		if let Err(err) = self.core.commit_initialize() {
			self.window = None;
			self.core.abort_initialize();
			return Err(err);
		}
		Ok(())
	}

	/// Native window handle for EGL surface creation; null before
	/// initialization.
	pub fn native_window(&self) -> *mut c_void {
		self.window
			.as_ref()
			.map_or(ptr::null_mut(), |window| window.ptr() as *mut c_void)
	}

	/// Accepted and ignored: drawable dimensions are fixed at creation.
	pub fn resize(&mut self, _width: u32, _height: u32) {}

	/// Arms the frame-completion signal for the next rendered frame.
	pub fn frame_will_render(&mut self) -> Result<(), BackendError> {
		self.core.frame_will_render()
	}

	/// The host finished issuing GL for this frame; nothing to do here.
	pub fn frame_rendered(&mut self) {}

	/// Whether the drawable exists and the identity announcement went out.
	pub fn is_initialized(&self) -> bool {
		self.core.is_initialized()
	}

	/// Whether a frame-completion callback is pending.
	pub fn is_armed(&self) -> bool {
		self.core.is_armed()
	}

	/// Protocol id of the announced surface, once initialized.
	pub fn surface_id(&self) -> Option<u32> {
		self.core.surface_id()
	}
}
