//! C tables for the raster-style backend and its render targets.

use std::ffi::{c_int, c_void};
use std::os::fd::{FromRawFd, OwnedFd};
use std::ptr;

use tracing::warn;

use super::host::{current_loop, host_frame_complete, with_broker};
use crate::egl::{EglBackend, EglTarget};

/// Opaque C handle around an [`EglBackend`].
pub struct SillEglBackend {
	inner: EglBackend,
}

/// Opaque C handle around an [`EglTarget`].
pub struct SillEglTarget {
	inner: EglTarget,
}

unsafe extern "C" fn backend_create(host_fd: c_int) -> *mut SillEglBackend {
	if host_fd < 0 {
		return ptr::null_mut();
	}
	let Some(loop_handle) = current_loop() else {
		warn!("no current loop on this thread; cannot create backend");
		return ptr::null_mut();
	};
	let fd = unsafe { OwnedFd::from_raw_fd(host_fd) };
	let inner = with_broker(|broker| EglBackend::new(broker, &loop_handle, fd));
	Box::into_raw(Box::new(SillEglBackend { inner }))
}

unsafe extern "C" fn backend_destroy(backend: *mut SillEglBackend) {
	if !backend.is_null() {
		drop(unsafe { Box::from_raw(backend) });
	}
}

unsafe extern "C" fn backend_get_native_display(backend: *mut SillEglBackend) -> *mut c_void {
	match unsafe { backend.as_ref() } {
		Some(backend) => backend.inner.native_display(),
		None => ptr::null_mut(),
	}
}

unsafe extern "C" fn target_create(token: *mut c_void, host_fd: c_int) -> *mut SillEglTarget {
	if host_fd < 0 {
		return ptr::null_mut();
	}
	let fd = unsafe { OwnedFd::from_raw_fd(host_fd) };
	let target = EglTarget::new(fd);
	let token = token as usize;
	target.on_frame_complete(move || host_frame_complete(token));
	Box::into_raw(Box::new(SillEglTarget { inner: target }))
}

unsafe extern "C" fn target_destroy(target: *mut SillEglTarget) {
	if !target.is_null() {
		drop(unsafe { Box::from_raw(target) });
	}
}

unsafe extern "C" fn target_initialize(
	target: *mut SillEglTarget,
	backend: *mut SillEglBackend,
	width: u32,
	height: u32,
) {
	let Some(target) = (unsafe { target.as_mut() }) else {
		return;
	};
	let Some(backend) = (unsafe { backend.as_ref() }) else {
		return;
	};
	let Some(loop_handle) = current_loop() else {
		warn!("no current loop on this thread; cannot initialize target");
		return;
	};
	if let Err(err) = target
		.inner
		.initialize(&backend.inner, &loop_handle, width, height)
	{
		warn!("target initialization failed: {err}");
	}
}

unsafe extern "C" fn target_get_native_window(target: *mut SillEglTarget) -> *mut c_void {
	match unsafe { target.as_ref() } {
		Some(target) => target.inner.native_window(),
		None => ptr::null_mut(),
	}
}

unsafe extern "C" fn target_resize(target: *mut SillEglTarget, width: u32, height: u32) {
	if let Some(target) = unsafe { target.as_mut() } {
		target.inner.resize(width, height);
	}
}

unsafe extern "C" fn target_frame_will_render(target: *mut SillEglTarget) {
	if let Some(target) = unsafe { target.as_mut() }
		&& let Err(err) = target.inner.frame_will_render()
	{
		warn!("frame arming failed: {err}");
	}
}

unsafe extern "C" fn target_frame_rendered(target: *mut SillEglTarget) {
	if let Some(target) = unsafe { target.as_mut() } {
		target.inner.frame_rendered();
	}
}

/// Raster-style backend function table.
#[repr(C)]
pub struct SillRendererEglInterface {
	pub create: unsafe extern "C" fn(c_int) -> *mut SillEglBackend,
	pub destroy: unsafe extern "C" fn(*mut SillEglBackend),
	pub get_native_display: unsafe extern "C" fn(*mut SillEglBackend) -> *mut c_void,
}

pub static SILL_RENDERER_EGL_INTERFACE: SillRendererEglInterface = SillRendererEglInterface {
	create: backend_create,
	destroy: backend_destroy,
	get_native_display: backend_get_native_display,
};

/// Raster-style render-target function table.
#[repr(C)]
pub struct SillRendererEglTargetInterface {
	pub create: unsafe extern "C" fn(*mut c_void, c_int) -> *mut SillEglTarget,
	pub destroy: unsafe extern "C" fn(*mut SillEglTarget),
	pub initialize: unsafe extern "C" fn(*mut SillEglTarget, *mut SillEglBackend, u32, u32),
	pub get_native_window: unsafe extern "C" fn(*mut SillEglTarget) -> *mut c_void,
	pub resize: unsafe extern "C" fn(*mut SillEglTarget, u32, u32),
	pub frame_will_render: unsafe extern "C" fn(*mut SillEglTarget),
	pub frame_rendered: unsafe extern "C" fn(*mut SillEglTarget),
}

pub static SILL_RENDERER_EGL_TARGET_INTERFACE: SillRendererEglTargetInterface =
	SillRendererEglTargetInterface {
		create: target_create,
		destroy: target_destroy,
		initialize: target_initialize,
		get_native_window: target_get_native_window,
		resize: target_resize,
		frame_will_render: target_frame_will_render,
		frame_rendered: target_frame_rendered,
	};
