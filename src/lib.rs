pub mod agent;
pub mod clock;
pub mod config;
pub mod datasource;
pub mod ingress;
pub mod server;
pub mod transcript;
