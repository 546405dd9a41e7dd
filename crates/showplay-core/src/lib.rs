//! ShowPlay Core - shared building blocks for show playback
//!
//! This crate contains the pieces the I/O and control crates build on:
//! - **Buffer pool**: size-bucketed recycling of byte buffers
//! - **Budget cache**: generic priority/budget cache with reference-counted handles
//! - **Min-heap**: next-send-time scheduling of controllers
//! - **Controller descriptors**: static controller setup and open reports
//! - **Logging configuration**

#![allow(missing_docs)]

/// Size-bucketed byte buffer recycler
pub mod buffer_pool;
/// Generic priority/budget cache
pub mod cache;
/// Controller setup and open reports
pub mod controller;
/// Error types
pub mod error;
/// Logging configuration
pub mod logging;
/// Scheduling min-heap
pub mod min_heap;

pub use buffer_pool::{BufferPool, BufferPoolConfig, BufferPoolStats};
pub use cache::{
    deadline_order, AcquireRequest, BudgetCache, BudgetCacheOptions, CacheHandle, CacheSource, CacheStats,
    ItemStatus, Millis, PrefetchSpec,
};
pub use controller::{ControllerProtocol, ControllerSetup, OpenControllerReport, OpenStatus, PingOutcome};
pub use error::{BoxError, CacheError, CoreError, Result};
pub use logging::LogConfig;
pub use min_heap::{MinHeap, Scheduled};
