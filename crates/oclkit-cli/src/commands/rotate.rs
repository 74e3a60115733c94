//! Image rotation command

use anyhow::{Context, Result};
use clap::Parser;
use oclkit_session::{kernels, pipeline, RotateParams, Session, SessionConfig};
use std::path::PathBuf;
use tracing::info;

/// Rotate a ramp image about its centre and print the result grid
#[derive(Debug, Parser)]
pub struct RotateCommand {
    /// Image width in pixels
    #[arg(long, value_name = "PIXELS", default_value_t = 6)]
    pub width: usize,

    /// Image height in pixels
    #[arg(long, value_name = "PIXELS", default_value_t = 6)]
    pub height: usize,

    /// Rotation angle
    #[arg(long, value_name = "DEGREES", conflicts_with_all = ["sin", "cos"])]
    pub angle_degrees: Option<f32>,

    /// Sine of the rotation angle (requires --cos)
    #[arg(long, value_name = "VALUE", requires = "cos", allow_negative_numbers = true)]
    pub sin: Option<f32>,

    /// Cosine of the rotation angle (requires --sin)
    #[arg(long, value_name = "VALUE", requires = "sin", allow_negative_numbers = true)]
    pub cos: Option<f32>,

    /// OpenCL C source to build instead of the bundled kernel
    #[arg(long, value_name = "PATH")]
    pub kernel_file: Option<PathBuf>,
}

impl RotateCommand {
    fn params(&self) -> RotateParams {
        match (self.sin, self.cos) {
            (Some(sin), Some(cos)) => RotateParams { width: self.width, height: self.height, sin, cos },
            _ => RotateParams::from_degrees(self.width, self.height, self.angle_degrees.unwrap_or(90.0)),
        }
    }

    pub fn execute(&self, config: &SessionConfig) -> Result<()> {
        anyhow::ensure!(self.width > 0 && self.height > 0, "image dimensions must be non-zero");
        let source = super::load_source(self.kernel_file.as_deref(), kernels::IMAGE_ROTATE_SRC)?;
        let params = self.params();
        info!(width = params.width, height = params.height, sin = params.sin, cos = params.cos, "running image rotation");

        let mut session = Session::from_config(config.clone()).context("failed to open compute session")?;
        let image = pipeline::image_rotate(&mut session, &source, &params).context("image rotation failed")?;

        for row in image.chunks(params.width) {
            let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            println!("{}", cells.join(" "));
        }
        Ok(())
    }
}
