//! C ABI surface: function tables and the name → table lookup.
//!
//! The host resolves tables by well-known name through
//! [`sill_loader_lookup`] and drives everything else through the returned
//! function pointers. All tables assume the single-threaded contract of the
//! rest of the crate: backends and targets attach to the loop made current
//! on the calling thread via the host interface.

use std::ffi::{CStr, c_char, c_void};
use std::ptr;

pub mod egl;
pub mod host;
pub mod vulkan;

/// Resolves a well-known interface name to its function table.
///
/// Unknown names return null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sill_loader_lookup(object_name: *const c_char) -> *const c_void {
	if object_name.is_null() {
		return ptr::null();
	}
	let name = unsafe { CStr::from_ptr(object_name) };
	match name.to_bytes() {
		b"_sill_renderer_host_interface" => {
			(&raw const host::SILL_RENDERER_HOST_INTERFACE).cast()
		}
		b"_sill_renderer_egl_interface" => (&raw const egl::SILL_RENDERER_EGL_INTERFACE).cast(),
		b"_sill_renderer_egl_target_interface" => {
			(&raw const egl::SILL_RENDERER_EGL_TARGET_INTERFACE).cast()
		}
		b"_sill_renderer_vulkan_interface" => {
			(&raw const vulkan::SILL_RENDERER_VULKAN_INTERFACE).cast()
		}
		b"_sill_renderer_vulkan_target_interface" => {
			(&raw const vulkan::SILL_RENDERER_VULKAN_TARGET_INTERFACE).cast()
		}
		_ => ptr::null(),
	}
}

#[cfg(test)]
mod tests {
	use std::ffi::{CString, c_void};
	use std::ptr;

	use super::sill_loader_lookup;

	fn lookup(name: &str) -> *const c_void {
		let name = CString::new(name).expect("name");
		unsafe { sill_loader_lookup(name.as_ptr()) }
	}

	#[test]
	fn known_names_resolve_to_distinct_tables() {
		let names = [
			"_sill_renderer_host_interface",
			"_sill_renderer_egl_interface",
			"_sill_renderer_egl_target_interface",
			"_sill_renderer_vulkan_interface",
			"_sill_renderer_vulkan_target_interface",
		];
		let tables: Vec<_> = names.iter().map(|name| lookup(name)).collect();
		for table in &tables {
			assert!(!table.is_null());
		}
		for (i, a) in tables.iter().enumerate() {
			for b in &tables[i + 1..] {
				assert_ne!(a, b);
			}
		}
	}

	#[test]
	fn unknown_names_return_null() {
		assert!(lookup("_sill_renderer_imaginary_interface").is_null());
		assert!(lookup("").is_null());
		assert!(unsafe { sill_loader_lookup(ptr::null()) }.is_null());
	}
}
