//! Platform and device info dump

use anyhow::{Context, Result};
use clap::Parser;
use console::style;
use oclkit_session::{driver, list_devices, list_platforms, DeviceType, SessionConfig};

/// List every platform and its devices
#[derive(Debug, Parser)]
pub struct PlatformsCommand {
    /// Only show devices matching the configured device type
    #[arg(long)]
    pub filtered: bool,
}

impl PlatformsCommand {
    pub fn execute(&self, config: &SessionConfig) -> Result<()> {
        let driver = driver::open(config.driver).context("failed to open driver")?;
        let platforms = list_platforms(&driver).collect::<Result<Vec<_>, _>>().context("platform enumeration failed")?;
        let filter = if self.filtered { config.device_type } else { DeviceType::ALL };

        println!("{}", style(format!("Enumerated {} platforms.", platforms.len())).bold());
        println!();
        for (i, platform) in platforms.iter().enumerate() {
            println!("{}", style(format!("Platform[{i}]:")).bold().cyan());
            println!("\tName:           {}", platform.name);
            println!("\tVendor:         {}", platform.vendor);
            println!("\tDriver Version: {}", platform.version);
            println!("\tProfile:        {}", platform.profile);
            println!("\tExtensions:     {}", platform.extensions.join(" "));

            let devices = list_devices(driver.as_ref(), platform, filter)
                .with_context(|| format!("device query failed on platform '{}'", platform.name))?;
            for (j, device) in devices.iter().enumerate() {
                println!("{}", style(format!("Device[{j}]:")).bold());
                println!("\tType:           {}", device.device_type);
                println!("\tName:           {}", device.name);
                println!("\tVendor:         {}", device.vendor);
                println!("\tDevice Version: {}", device.version);
                println!("\tDriver Version: {}", device.driver_version);
                println!("\tVendor ID:      {:#06x}", device.vendor_id);
                println!("\tCompute Units:  {}", device.compute_units);
                println!("\tWork Group:     {} (items {:?})", device.max_work_group_size, device.max_work_item_sizes);
                println!("\tGlobal Memory:  {} MiB", device.global_mem_bytes / (1024 * 1024));
            }
            println!();
        }
        println!("Done.");
        Ok(())
    }
}
