pub mod capability;
pub mod config;
pub mod context;
pub mod cpu;
pub mod enumerator;
pub mod metrics;
pub mod model;
pub mod pf_topology;
pub mod protocol;
pub mod section;
pub mod server;

pub use config::Config;
pub use context::Context;
pub use metrics::Metrics;
