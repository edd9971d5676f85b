//! # EntityCore
//!
//! A mid-level Vulkan runtime sitting between the raw GPU API and an
//! application's rendering code.
//!
//! ## Features
//!
//! - **Device Context**: instance and device selection, queue-family
//!   carving, swap-chain lifecycle, pipeline-cache persistence
//! - **Device-Memory Allocator**: chunked sub-allocation with coalescing
//!   free-lists and independent batches for contention-free threading
//! - **Buffer Sub-Allocator**: typed sub-buffers carved out of one backing
//!   buffer, with size buckets and a high-water mark
//! - **Sync Primitive**: barrier accumulation replayed as pipeline barriers
//!   or event dependencies, with a classic fallback for devices without the
//!   newer synchronization extension
//! - **Frame Orchestrator**: per-subpass batches of secondary command
//!   buffers finalized by a helper thread
//! - **Transfer Planner**: staging reservations batched into one barrier
//!   and one copy call per destination buffer
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use entity_core::config::{ContextCreateInfo, ContextSettings};
//! use entity_core::context::VulkanContext;
//!
//! let ctx = VulkanContext::new(ContextCreateInfo {
//!     settings: ContextSettings {
//!         application_name: "demo".into(),
//!         width: 1280,
//!         height: 720,
//!         ..ContextSettings::default()
//!     },
//!     ..ContextCreateInfo::default()
//! });
//! // Build render passes, frames and resources on top of `ctx`
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod buffer;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod frame;
pub mod logging;
pub mod memory;
pub mod pipeline;
pub mod render;
pub mod sync;
pub mod texture;
pub mod transfer;
pub mod vertex;

pub use buffer::{BufferMgr, SubBuffer};
pub use config::{ContextCreateInfo, ContextSettings, WindowHandles};
pub use context::features::FeatureSet;
pub use context::queues::{QueueFamily, QueueRequirement, QueueType};
pub use context::swapchain::{AcquireOutcome, ViewportState};
pub use context::VulkanContext;
pub use descriptor::{Set, SetMgr};
pub use error::{VulkanError, VulkanResult};
pub use frame::{FrameHelper, FrameMgr};
pub use logging::LogLevel;
pub use memory::{MemoryAllocator, MemoryQuery, SubMemory};
pub use pipeline::layout::PipelineLayout;
pub use pipeline::Pipeline;
pub use render::RenderMgr;
pub use sync::SyncEvent;
pub use texture::Texture;
pub use transfer::TransferMgr;
pub use vertex::{VertexArray, VertexBuffer};
