//! Vector addition command

use anyhow::{Context, Result};
use clap::Parser;
use console::style;
use oclkit_session::{kernels, pipeline, Session, SessionConfig};
use std::path::PathBuf;
use tracing::info;

/// Add two vectors on the device and print the sums
#[derive(Debug, Parser)]
pub struct AddCommand {
    /// Number of elements per vector
    #[arg(short = 'n', long, value_name = "N", default_value_t = 1000)]
    pub input_size: usize,

    /// OpenCL C source to build instead of the bundled kernel
    #[arg(long, value_name = "PATH")]
    pub kernel_file: Option<PathBuf>,

    /// Work-group size; the driver picks one when omitted
    #[arg(long, value_name = "N")]
    pub local_size: Option<usize>,
}

impl AddCommand {
    pub fn execute(&self, config: &SessionConfig) -> Result<()> {
        anyhow::ensure!(self.input_size > 0, "--input-size must be at least 1");
        let source = super::load_source(self.kernel_file.as_deref(), kernels::VECTOR_ADD_SRC)?;
        info!(n = self.input_size, local = ?self.local_size, "running vector add");

        let mut session = Session::from_config(config.clone()).context("failed to open compute session")?;
        let result = pipeline::vector_add(&mut session, &source, self.input_size, self.local_size)
            .context("vector add failed")?;

        let line: Vec<String> = result.iter().map(|v| v.to_string()).collect();
        println!("{}", line.join(" "));

        let expected = self.input_size as f32;
        let wrong = result.iter().filter(|&&v| v != expected).count();
        if wrong == 0 {
            println!("{}", style("Executed program successfully.").green());
        } else {
            println!("{}", style(format!("{wrong} of {} results differ from {expected}", result.len())).yellow());
        }
        Ok(())
    }
}
