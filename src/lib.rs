pub mod args;
pub mod config;
pub mod engine;
pub mod error;
pub mod estimate;
pub mod events;
pub mod hop_stats;
pub mod probe;
pub mod report;
pub mod resolver;
pub mod utils;

// Re-export commonly used types
pub use args::Args;
pub use config::EngineConfig;
pub use engine::{HopProbeEngine, HopResult, SessionState};
pub use error::{EngineError, ProbeError};
pub use events::{DeliveryContext, DeliveryPump, SessionEvent};
pub use hop_stats::{HopRecord, ProbeSample};
pub use probe::{IcmpTransport, ProbeReply, ProbeStatus, ProbeTransport, SimulatedTransport};
pub use resolver::{HickoryResolver, NameResolver};

// Re-export external dependencies commonly used across modules
pub use anyhow::Result;
pub use std::net::IpAddr;
pub use std::time::Duration;
