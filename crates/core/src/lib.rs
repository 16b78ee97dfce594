//! SnapGrid Core Library
//!
//! Bounded-concurrency scheduling of remote visual test sessions, plus the
//! resource crawler used when pages are rendered server-side.
//!
//! Callers talk to a [`Scheduler`]; a single service runner task owns every
//! test and drives five services (resource collection, render, open, check,
//! close) once per tick. Remote calls run as spawned tasks whose outcomes the
//! runner drains on its next tick.

pub mod check_task;
pub mod config;
pub mod connector;
pub mod crawler;
pub mod error;
pub mod resource;
pub mod results;
pub mod running_test;
pub mod scheduler;
pub mod services;
pub mod simulated;
pub mod types;

mod runner;

// Re-export commonly used types
pub use config::{default_config_path, CrawlerConfig, OpenRetryConfig, RenderConfig, SchedulerConfig};
pub use connector::{DownloadContext, ResourceFetcher, ServerConnector, UnavailableFetcher};
pub use crawler::{CrawlStats, DomAnalyzer};
pub use error::{GridError, GridResult};
pub use resource::{new_resource_cache, CollectedDom, FrameData, Resource, ResourceCache};
pub use results::{TestResultContainer, TestResultsSummary};
pub use running_test::TestState;
pub use scheduler::{Scheduler, SchedulerBuilder};
pub use simulated::{SimulatedConnector, SimulatedServerConfig, StaticResourceFetcher};
pub use types::*;

/// SnapGrid version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
