//! Core Vulkan rendering runtime: device/instance bring-up, GPU memory
//! suballocation, an async host-to-device transfer engine, swapchain
//! lifecycle management, and a per-frame renderer built on dynamic
//! rendering and `synchronization2`.
//!
//! Scene graph construction, asset decoding, windowing, and shader source
//! compilation are external collaborators — this crate consumes opaque
//! byte blobs and per-frame draw lists, nothing more.

pub mod allocator;
pub mod command;
pub mod config;
pub mod deferred;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod frame;
mod instance;
pub mod physical_device;
pub mod resource;
mod surface;
pub mod swapchain;
pub mod transfer;
pub mod types;

/// External dependencies exposed outside of this crate, matching the
/// teacher's convention of re-exporting the graphics stack callers need to
/// build `vk::*` values and platform handles without pinning their own
/// dependency versions against ours.
pub use ash::{self, vk};
pub use gpu_allocator;
pub use raw_window_handle;

pub use device::Device;
pub use error::{Error, Result};
