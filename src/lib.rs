//! Procsentry supervises external programs and samples host CPU and memory.
//! A [`supervisor::ProcessSupervisor`] launches a program on a monitoring
//! thread, captures its output, records its exit code and can relaunch it;
//! the [`system_info`] facade exposes processor topology, memory figures,
//! process enumeration and per-process CPU usage through a per-platform
//! [`probe::CpuMemoryProbe`].

/// Archive creation and extraction through a supervised archiver.
pub mod archive;

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Shared constants and sentinels.
pub mod constants;

/// Error handling.
pub mod error;

/// Logger collaborator and diagnostic throttling.
pub mod logs;

/// Per-platform host probes.
pub mod probe;

/// Process supervision.
pub mod supervisor;

/// Process-wide probe facade.
pub mod system_info;

#[doc(hidden)]
pub mod test_utils;
