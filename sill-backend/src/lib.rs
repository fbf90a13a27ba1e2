//! Display-server client bridge for sandboxed renderers.
//!
//! A sandboxed rendering process uses this crate to produce GPU-composited
//! frames on behalf of a host: one shared display-server connection per
//! process, an EGL or Vulkan context on top of it, and per-surface render
//! targets that announce their drawable over a host control socket and pace
//! frames through server frame callbacks. Everything runs single-threaded on
//! a host-driven [`sill_loop`] reactor.
//!
//! Rust embedders use [`DisplayBroker`], the backends and the targets
//! directly; C hosts resolve the exported function tables through
//! `sill_loader_lookup`.

mod c_bindings;
mod display;
mod egl;
mod error;
mod target;
mod vulkan;

pub use display::{DISPLAY_SOURCE_PRIORITY, DisplayBroker, DisplayHandle, FRAME_SOURCE_PRIORITY};
pub use egl::{EglBackend, EglTarget};
pub use error::BackendError;
pub use target::RendererBackend;
pub use vulkan::{VulkanBackend, VulkanTarget};
