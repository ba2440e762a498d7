// telemetry-client: Library entry point.
// Exposes modules for integration testing.

pub mod backoff;
pub mod cache;
pub mod client;
pub mod config;
pub mod session;
pub mod status_log;
pub mod supervisor;
pub mod target;

pub use cache::{LatestValueCache, TelemetrySnapshot};
pub use client::TelemetryClient;
pub use config::{ClientConfig, ConfigError};
pub use supervisor::{ClientStatus, FailureReason, PhaseKind};
pub use target::{BaseTargetResolver, StaticBase, StaticToken, TokenFile, TokenProvider};
