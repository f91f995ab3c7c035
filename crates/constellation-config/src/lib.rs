pub mod loader;
pub mod model;

pub use loader::ConfigLoader;
pub use model::{
    AgentConfig, AppConfig, DEFAULT_END_MARKER, GatewayConfig, MemoryConfig, RelayConfig,
    RetryConfig,
};
