//! CLI command implementations

pub mod add;
pub mod platforms;
pub mod rotate;

pub use add::AddCommand;
pub use platforms::PlatformsCommand;
pub use rotate::RotateCommand;

use anyhow::{Context, Result};
use std::path::Path;

/// Kernel source from `path`, or the bundled `fallback`.
pub(crate) fn load_source(path: Option<&Path>, fallback: &str) -> Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read kernel file {}", path.display())),
        None => Ok(fallback.to_string()),
    }
}
