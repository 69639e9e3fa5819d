pub mod build_config;
pub mod config;
pub mod defconfig;
pub mod environment;
pub mod error;
pub mod executor;
pub mod launcher;
pub mod manifest;
pub mod modules;
pub mod patch;
pub mod planner;
pub mod resolver;
pub mod workspace;

pub use error::{Error, ErrorKind, Result};
