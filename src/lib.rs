pub mod ai;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod server;
pub mod sql;
pub mod storage;

pub use error::{Error, Result};
