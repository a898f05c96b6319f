//! Sampling CPU Profiler Engine
//!
//! This library turns raw stack samples into per-session call trees. It
//! tracks generated code by address range, resolves each sample into a
//! path of logical functions (inlined frames included) and aggregates the
//! path into every active profile, with self ticks, per-line ticks and a
//! deoptimization log per node.
//!
//! [`CpuProfiler`] is the usual entry point; the building blocks
//! ([`collector::code_map::CodeMap`], [`profile::tree::ProfileTree`],
//! [`profile::collection::CpuProfilesCollection`],
//! [`collector::generator::ProfileGenerator`]) can be used on their own.

pub mod collector;
pub mod config;
pub mod error;
pub mod output;
pub mod processor;
pub mod profile;
pub mod profiler;

pub use config::ProfilerConfig;
pub use error::{ProfilerError, Result};
pub use processor::{ProcessorEvent, ProcessorStats};
pub use profile::collection::StartProfilingStatus;
pub use profile::CpuProfile;
pub use profiler::CpuProfiler;
