pub mod defaults;
pub mod proxy_config;
pub mod settings;
