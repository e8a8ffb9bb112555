mod raw;
mod loader;
mod process;
pub mod error;

pub use error::ConfigError;
pub use loader::{load_images, load_machines, load_scripts};
pub use process::ProcessConfig;
