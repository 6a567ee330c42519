pub mod balance;
pub mod error;
pub mod flow;
pub mod jwt;
pub mod model;
pub mod snapshot;
pub mod transport;

pub use error::GatewayError;
pub use model::{AccessControl, App, LoadType, RoundType, RuleType, ServiceDetail};
pub use snapshot::{ConfigSnapshot, ConfigStore};
