//! Explicit-API backend: a Vulkan instance over the shared display
//! connection.

use std::os::fd::OwnedFd;

use ash::vk;
use sill_loop::LoopHandle;
use tracing::{debug, warn};
use wayland_client::Proxy;

use crate::display::{DisplayBroker, DisplayHandle};
use crate::error::BackendError;
use crate::target::{RendererBackend, TargetCore};

struct VulkanStack {
	entry: ash::Entry,
	instance: ash::Instance,
}

/// Process-wide explicit-API GPU context bound to the shared display
/// connection.
pub struct VulkanBackend {
	display: Option<DisplayHandle>,
	vulkan: Option<VulkanStack>,
}

impl VulkanBackend {
	/// Shares or establishes the display connection over `fd` and creates a
	/// Vulkan instance with the surface extensions. Either failure is
	/// non-fatal here: the affected handle stays unset and target
	/// initialization fails downstream.
	pub fn new(broker: &DisplayBroker, loop_handle: &LoopHandle, fd: OwnedFd) -> Self {
		let display = match broker.connect(fd, loop_handle) {
			Ok(handle) => Some(handle),
			Err(err) => {
				warn!("display connection failed: {err}");
				None
			}
		};
		let vulkan = if display.is_some() {
			match init_vulkan() {
				Ok(stack) => Some(stack),
				Err(err) => {
					warn!("vulkan initialization failed: {err}");
					None
				}
			}
		} else {
			None
		};
		Self { display, vulkan }
	}

	/// Raw `VkInstance` handle; null when instance creation failed.
	pub fn instance_handle(&self) -> vk::Instance {
		self.vulkan
			.as_ref()
			.map_or(vk::Instance::null(), |stack| stack.instance.handle())
	}

	fn stack(&self) -> Option<&VulkanStack> {
		self.vulkan.as_ref()
	}
}

impl RendererBackend for VulkanBackend {
	fn display(&self) -> Option<&DisplayHandle> {
		self.display.as_ref()
	}

	fn has_gpu_instance(&self) -> bool {
		self.vulkan.is_some()
	}
}

impl Drop for VulkanBackend {
	fn drop(&mut self) {
		if let Some(stack) = self.vulkan.take() {
			unsafe { stack.instance.destroy_instance(None) };
		}
	}
}

fn init_vulkan() -> Result<VulkanStack, BackendError> {
	let entry =
		unsafe { ash::Entry::load() }.map_err(|err| BackendError::VulkanLoad(err.to_string()))?;
	let application_info = vk::ApplicationInfo::default()
		.application_name(c"sill-backend")
		.application_version(1)
		.api_version(vk::make_api_version(0, 1, 0, 2));
	let extension_names = [
		ash::khr::surface::NAME.as_ptr(),
		ash::khr::wayland_surface::NAME.as_ptr(),
	];
	let create_info = vk::InstanceCreateInfo::default()
		.application_info(&application_info)
		.enabled_extension_names(&extension_names);
	let instance = unsafe { entry.create_instance(&create_info, None) }
		.map_err(BackendError::VulkanInstance)?;
	debug!("vulkan instance created");
	Ok(VulkanStack { entry, instance })
}

/// Explicit-API render target: a `VkSurfaceKHR` drawable over a compositing
/// surface.
pub struct VulkanTarget {
	surface: vk::SurfaceKHR,
	surface_fn: Option<ash::khr::surface::Instance>,
	core: TargetCore,
}

impl VulkanTarget {
	/// Creates a Bound target over the host control socket.
	pub fn new(fd: OwnedFd) -> Self {
		Self {
			surface: vk::SurfaceKHR::null(),
			surface_fn: None,
			core: TargetCore::new(fd),
		}
	}

	/// Installs the host-visible frame-complete listener.
	pub fn on_frame_complete(&self, callback: impl FnMut() + 'static) {
		self.core.set_frame_complete_listener(Box::new(callback));
	}

	/// Creates the `VkSurfaceKHR` drawable and announces it to the host.
	///
	/// The surface takes its extent from the swapchain the host builds on
	/// it, so `width`/`height` only document intent here.
	pub fn initialize(
		&mut self,
		backend: &VulkanBackend,
		loop_handle: &LoopHandle,
		width: u32,
		height: u32,
	) -> Result<(), BackendError> {
		debug!(width, height, "initializing explicit-API target");
		let surface = self.core.begin_initialize(backend, loop_handle)?;
		let Some(stack) = backend.stack() else {
			self.core.abort_initialize();
			return Err(BackendError::NoGpuInstance);
		};
		let Some(display) = backend.display() else {
			self.core.abort_initialize();
			return Err(BackendError::NoConnection);
		};

		let wayland_surface_fn =
			ash::khr::wayland_surface::Instance::new(&stack.entry, &stack.instance);
		let create_info = vk::WaylandSurfaceCreateInfoKHR::default()
			.display(display.display_ptr().cast())
			.surface(surface.id().as_ptr().cast());
		match unsafe { wayland_surface_fn.create_wayland_surface(&create_info, None) } {
			Ok(vk_surface) => {
				self.surface = vk_surface;
				self.surface_fn = Some(ash::khr::surface::Instance::new(
					&stack.entry,
					&stack.instance,
				));
			}
			Err(err) => {
				self.core.abort_initialize();
				return Err(BackendError::VulkanSurface(err));
			}
		}
		if let Err(err) = self.core.commit_initialize() {
			self.destroy_surface();
			self.core.abort_initialize();
			return Err(err);
		}
		Ok(())
	}

	/// The `VkSurfaceKHR` drawable; null before initialization.
	pub fn surface(&self) -> vk::SurfaceKHR {
		self.surface
	}

	/// Accepted and ignored: the drawable is fixed at creation.
	pub fn resize(&mut self, _width: u32, _height: u32) {}

	/// Arms the frame-completion signal for the next rendered frame.
	pub fn frame_will_render(&mut self) -> Result<(), BackendError> {
		self.core.frame_will_render()
	}

	/// The host finished recording the frame; nothing to do here.
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

	fn destroy_surface(&mut self) {
		if let Some(surface_fn) = self.surface_fn.take()
			&& self.surface != vk::SurfaceKHR::null()
		{
			unsafe { surface_fn.destroy_surface(self.surface, None) };
			self.surface = vk::SurfaceKHR::null();
		}
	}
}

impl Drop for VulkanTarget {
	// Runs before `core` drops, so the Vulkan surface dies before the
	// compositing surface it was created on.
	fn drop(&mut self) {
		self.destroy_surface();
	}
}
