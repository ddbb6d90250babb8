pub mod schema;

pub use schema::{
    Config, DatabaseConfig, GatewayConfig, ProviderConfig, ProviderKind, WeChatConfig,
    CONFIG_PATH_ENV,
};
