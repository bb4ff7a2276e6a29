// GeoFlow Core - orchestration domain, ports and application services
// NO infrastructure dependencies (hexagonal architecture)

pub mod application;
pub mod domain;
pub mod error;
pub mod port;
pub mod testing;

pub use error::{EngineError, Result};
