pub mod config;
pub mod error;
pub mod scene;
pub mod vulkan;

pub use config::RaytracingConfig;
pub use error::{AccelError, Result};
