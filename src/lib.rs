pub mod anvil_config;
pub mod audit;
pub mod config;
pub mod errors;
pub mod gates;
pub mod logging;
pub mod orchestrator;
pub mod project;
pub mod prompt;
pub mod provider;
pub mod stage;
pub mod store;
pub mod suspension;
