pub mod archive;
pub mod cli;
pub mod client;
pub mod config;
pub mod daemon;
pub mod error;
pub mod model;
pub mod notify;
pub mod orchestrator;
pub mod paths;
pub mod pid;
pub mod ports;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod store;
pub mod supervisor;
pub mod validator;
pub mod watchdog;
