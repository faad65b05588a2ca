pub mod approval;
pub mod auth;
pub mod backend_config;
pub mod cli;
pub mod config;
pub mod control_ui;
pub mod error;
pub mod onboarding;
pub mod pool;
pub mod proxy;
pub mod setup;
pub mod supervisor;
pub mod telegram;
pub mod token;
pub mod workspace;
