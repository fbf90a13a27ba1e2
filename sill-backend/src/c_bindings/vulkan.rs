//! C tables for the explicit-API backend and its render targets.

use std::ffi::{c_int, c_void};
use std::os::fd::{FromRawFd, OwnedFd};
use std::ptr;

use ash::vk::Handle as _;
use tracing::warn;

use super::host::{current_loop, host_frame_complete, with_broker};
use crate::vulkan::{VulkanBackend, VulkanTarget};

/// Opaque C handle around a [`VulkanBackend`].
pub struct SillVulkanBackend {
	inner: VulkanBackend,
}

/// Opaque C handle around a [`VulkanTarget`].
pub struct SillVulkanTarget {
	inner: VulkanTarget,
}

unsafe extern "C" fn backend_create(host_fd: c_int) -> *mut SillVulkanBackend {
	if host_fd < 0 {
		return ptr::null_mut();
	}
	let Some(loop_handle) = current_loop() else {
		warn!("no current loop on this thread; cannot create backend");
		return ptr::null_mut();
	};
	let fd = unsafe { OwnedFd::from_raw_fd(host_fd) };
	let inner = with_broker(|broker| VulkanBackend::new(broker, &loop_handle, fd));
	Box::into_raw(Box::new(SillVulkanBackend { inner }))
}

unsafe extern "C" fn backend_destroy(backend: *mut SillVulkanBackend) {
	if !backend.is_null() {
		drop(unsafe { Box::from_raw(backend) });
	}
}

/// Raw `VkInstance` handle; null when instance creation failed.
unsafe extern "C" fn backend_get_instance(backend: *mut SillVulkanBackend) -> *mut c_void {
	match unsafe { backend.as_ref() } {
		Some(backend) => backend.inner.instance_handle().as_raw() as usize as *mut c_void,
		None => ptr::null_mut(),
	}
}

unsafe extern "C" fn target_create(token: *mut c_void, host_fd: c_int) -> *mut SillVulkanTarget {
	if host_fd < 0 {
		return ptr::null_mut();
	}
	let fd = unsafe { OwnedFd::from_raw_fd(host_fd) };
	let target = VulkanTarget::new(fd);
	let token = token as usize;
	target.on_frame_complete(move || host_frame_complete(token));
	Box::into_raw(Box::new(SillVulkanTarget { inner: target }))
}

unsafe extern "C" fn target_destroy(target: *mut SillVulkanTarget) {
	if !target.is_null() {
		drop(unsafe { Box::from_raw(target) });
	}
}

unsafe extern "C" fn target_initialize(
	target: *mut SillVulkanTarget,
	backend: *mut SillVulkanBackend,
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

/// Raw `VkSurfaceKHR` handle; null before initialization.
unsafe extern "C" fn target_get_surface(target: *mut SillVulkanTarget) -> u64 {
	match unsafe { target.as_ref() } {
		Some(target) => target.inner.surface().as_raw(),
		None => 0,
	}
}

unsafe extern "C" fn target_resize(target: *mut SillVulkanTarget, width: u32, height: u32) {
	if let Some(target) = unsafe { target.as_mut() } {
		target.inner.resize(width, height);
	}
}

unsafe extern "C" fn target_frame_will_render(target: *mut SillVulkanTarget) {
	if let Some(target) = unsafe { target.as_mut() }
		&& let Err(err) = target.inner.frame_will_render()
	{
		warn!("frame arming failed: {err}");
	}
}

unsafe extern "C" fn target_frame_rendered(target: *mut SillVulkanTarget) {
	if let Some(target) = unsafe { target.as_mut() } {
		target.inner.frame_rendered();
	}
}

/// Explicit-API backend function table.
#[repr(C)]
pub struct SillRendererVulkanInterface {
	pub create: unsafe extern "C" fn(c_int) -> *mut SillVulkanBackend,
	pub destroy: unsafe extern "C" fn(*mut SillVulkanBackend),
	pub get_instance: unsafe extern "C" fn(*mut SillVulkanBackend) -> *mut c_void,
}

pub static SILL_RENDERER_VULKAN_INTERFACE: SillRendererVulkanInterface =
	SillRendererVulkanInterface {
		create: backend_create,
		destroy: backend_destroy,
		get_instance: backend_get_instance,
	};

/// Explicit-API render-target function table.
#[repr(C)]
pub struct SillRendererVulkanTargetInterface {
	pub create: unsafe extern "C" fn(*mut c_void, c_int) -> *mut SillVulkanTarget,
	pub destroy: unsafe extern "C" fn(*mut SillVulkanTarget),
	pub initialize: unsafe extern "C" fn(*mut SillVulkanTarget, *mut SillVulkanBackend, u32, u32),
	pub get_surface: unsafe extern "C" fn(*mut SillVulkanTarget) -> u64,
	pub resize: unsafe extern "C" fn(*mut SillVulkanTarget, u32, u32),
	pub frame_will_render: unsafe extern "C" fn(*mut SillVulkanTarget),
	pub frame_rendered: unsafe extern "C" fn(*mut SillVulkanTarget),
}

pub static SILL_RENDERER_VULKAN_TARGET_INTERFACE: SillRendererVulkanTargetInterface =
	SillRendererVulkanTargetInterface {
		create: target_create,
		destroy: target_destroy,
		initialize: target_initialize,
		get_surface: target_get_surface,
		resize: target_resize,
		frame_will_render: target_frame_will_render,
		frame_rendered: target_frame_rendered,
	};
