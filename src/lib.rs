pub mod config;
pub mod constants;
pub mod db;
pub mod deadline;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod seed;
pub mod server;
pub mod service;
pub mod storage;
pub mod types;
pub mod validation;
