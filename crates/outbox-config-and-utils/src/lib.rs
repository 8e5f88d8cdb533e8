//! Configuration, paths, logging and core errors for the outbox relay.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{
    BrokerSettings, Config, PoisonPolicySetting, RelaySettings, DEFAULT_LOG_LEVEL,
};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, LogFormat};
pub use paths::Paths;
