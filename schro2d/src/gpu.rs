//! Vulkan implementation of the frame backend.
//!
//! The pieces are built leaf to root, each one only from the pieces before
//! it:
//!
//! ```text
//! context → allocator → { frame_ring, state } → pipeline → engine
//! ```
//!
//! Every object is registered in an [`OwnershipList`](crate::teardown::OwnershipList)
//! as soon as it exists. [`VulkanBackend`] owns that list and, on drop, waits
//! for the device to go idle before releasing everything in reverse creation
//! order.

pub mod allocator;
pub mod context;
pub mod engine;
pub mod frame_ring;
pub mod pipeline;
pub mod record;
pub mod state;
pub mod surface;

pub use allocator::{Allocator, HostBuffer};
pub use context::DeviceContext;
pub use engine::VulkanBackend;
pub use frame_ring::{FrameRing, FrameSlot, HostFlush};
pub use pipeline::ComputePipeline;
pub use state::StateStore;
pub use surface::{PresentableImage, SurfaceChain};
