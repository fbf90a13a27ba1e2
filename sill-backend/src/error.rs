use thiserror::Error;

/// Errors produced while bringing up the display link, the GPU stacks, and
/// render targets.
///
/// None of these are fatal to the host process: the C bindings flatten them
/// to null handles and the affected surface simply never renders.
#[derive(Debug, Error)]
pub enum BackendError {
	#[error("display connection failed: {0}")]
	Connect(#[from] wayland_client::ConnectError),
	#[error("display globals unavailable: {0}")]
	Globals(#[from] wayland_client::globals::GlobalError),
	#[error("display round-trip failed: {0}")]
	Roundtrip(#[from] wayland_client::DispatchError),
	#[error("no live display connection")]
	NoConnection,
	#[error("surface-compositing global is not bound")]
	CompositorUnbound,
	#[error("gpu instance is not available")]
	NoGpuInstance,
	#[error("target is already initialized")]
	AlreadyInitialized,
	#[error("target is not initialized")]
	NotInitialized,
	#[error("native window creation failed: {0}")]
	NativeWindow(String),
	#[error("failed to load the EGL library: {0}")]
	EglLoad(String),
	#[error("no EGL display for the connection")]
	EglDisplay,
	#[error("eglInitialize failed: {0}")]
	EglInit(khronos_egl::Error),
	#[error("failed to load the Vulkan library: {0}")]
	VulkanLoad(String),
	#[error("vkCreateInstance failed: {0}")]
	VulkanInstance(ash::vk::Result),
	#[error("vulkan surface creation failed: {0}")]
	VulkanSurface(ash::vk::Result),
}
