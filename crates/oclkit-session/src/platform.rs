//! Platform and device enumeration.
//!
//! A pure query layer: nothing here acquires a releasable resource. Platform
//! enumeration is a live, one-shot query exposed as the [`Platforms`]
//! iterator; device selection applies a [`DeviceType`] mask and picks the
//! first match in driver enumeration order.

use crate::driver::{DeviceId, Driver, PlatformId};
use crate::error::DiscoveryError;
use bitflags::bitflags;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

bitflags! {
    /// Device type mask. Values match `CL_DEVICE_TYPE_*`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceType: u64 {
        const DEFAULT = 1 << 0;
        const CPU = 1 << 1;
        const GPU = 1 << 2;
        const ACCELERATOR = 1 << 3;
        const CUSTOM = 1 << 4;
        const ALL = 0xFFFF_FFFF;
    }
}

const NAMED_TYPES: [(DeviceType, &str); 5] = [
    (DeviceType::DEFAULT, "DEFAULT"),
    (DeviceType::CPU, "CPU"),
    (DeviceType::GPU, "GPU"),
    (DeviceType::ACCELERATOR, "ACCELERATOR"),
    (DeviceType::CUSTOM, "CUSTOM"),
];

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::ALL {
            return write!(f, "ALL");
        }
        let names: Vec<&str> =
            NAMED_TYPES.iter().filter(|(flag, _)| self.contains(*flag)).map(|(_, name)| *name).collect();
        if names.is_empty() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", names.join(" "))
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = String;

    /// Accepts a single type name or a union separated by `,`, `|`, `+` or spaces.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut mask = Self::empty();
        for part in s.split(|c: char| matches!(c, ',' | '|' | '+') || c.is_whitespace()) {
            if part.is_empty() {
                continue;
            }
            mask |= match part.to_lowercase().as_str() {
                "default" => Self::DEFAULT,
                "cpu" => Self::CPU,
                "gpu" => Self::GPU,
                "accelerator" | "acc" => Self::ACCELERATOR,
                "custom" => Self::CUSTOM,
                "all" => Self::ALL,
                other => return Err(format!("unknown device type: {other}")),
            };
        }
        if mask.is_empty() {
            return Err("device type filter is empty".to_string());
        }
        Ok(mask)
    }
}

/// A compute platform. Read-only snapshot taken at enumeration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub id: PlatformId,
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub profile: String,
    pub extensions: Vec<String>,
}

/// A compute device belonging to exactly one platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: DeviceId,
    pub platform: PlatformId,
    pub name: String,
    pub vendor: String,
    pub vendor_id: u32,
    pub device_type: DeviceType,
    pub compute_units: u32,
    pub max_work_group_size: usize,
    pub max_work_item_sizes: Vec<usize>,
    pub global_mem_bytes: u64,
    pub driver_version: String,
    /// Device version string (e.g. `OpenCL 3.0`).
    pub version: String,
}

impl Device {
    pub fn matches(&self, filter: DeviceType) -> bool {
        self.device_type.intersects(filter)
    }
}

enum Cursor {
    Pending,
    Ready(std::vec::IntoIter<Platform>),
    Done,
}

/// Lazy platform enumeration. The driver is queried on the first `next()`;
/// once exhausted the iterator stays exhausted.
pub struct Platforms {
    driver: Arc<dyn Driver>,
    cursor: Cursor,
}

impl Iterator for Platforms {
    type Item = Result<Platform, DiscoveryError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match &mut self.cursor {
                Cursor::Pending => match self.driver.platforms() {
                    Ok(platforms) if platforms.is_empty() => {
                        self.cursor = Cursor::Done;
                        return Some(Err(DiscoveryError::NoPlatformFound));
                    }
                    Ok(platforms) => {
                        debug!(driver = self.driver.name(), count = platforms.len(), "platforms enumerated");
                        self.cursor = Cursor::Ready(platforms.into_iter());
                    }
                    Err(e) => {
                        self.cursor = Cursor::Done;
                        return Some(Err(DiscoveryError::PlatformQueryFailed {
                            status: e.status,
                            message: e.message,
                        }));
                    }
                },
                Cursor::Ready(iter) => {
                    let next = iter.next();
                    if next.is_none() {
                        self.cursor = Cursor::Done;
                    }
                    return next.map(Ok);
                }
                Cursor::Done => return None,
            }
        }
    }
}

impl fmt::Debug for Platforms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cursor = match self.cursor {
            Cursor::Pending => "pending",
            Cursor::Ready(_) => "ready",
            Cursor::Done => "done",
        };
        f.debug_struct("Platforms").field("driver", &self.driver.name()).field("cursor", &cursor).finish()
    }
}

/// Start a platform enumeration against `driver`.
pub fn list_platforms(driver: &Arc<dyn Driver>) -> Platforms {
    Platforms { driver: Arc::clone(driver), cursor: Cursor::Pending }
}

/// All devices of `platform` matching `filter`, in enumeration order.
pub fn list_devices(
    driver: &dyn Driver,
    platform: &Platform,
    filter: DeviceType,
) -> Result<Vec<Device>, DiscoveryError> {
    let devices = driver
        .devices(platform.id, filter)
        .map_err(|e| DiscoveryError::DeviceQueryFailed { status: e.status, message: e.message })?;
    Ok(devices.into_iter().filter(|d| d.matches(filter)).collect())
}

/// First device of `platform` matching `filter`.
pub fn select_device(
    driver: &dyn Driver,
    platform: &Platform,
    filter: DeviceType,
) -> Result<Device, DiscoveryError> {
    let device = list_devices(driver, platform, filter)?
        .into_iter()
        .next()
        .ok_or(DiscoveryError::NoDeviceFound { filter })?;
    info!(platform = %platform.name, device = %device.name, device_type = %device.device_type, "device selected");
    Ok(device)
}

/// First device matching `filter`, scanning platforms in enumeration order.
///
/// With `platform_index` set only that platform is considered.
pub fn select_first_device(
    driver: &Arc<dyn Driver>,
    filter: DeviceType,
    platform_index: Option<usize>,
) -> Result<(Platform, Device), DiscoveryError> {
    let platforms = list_platforms(driver).collect::<Result<Vec<_>, _>>()?;

    if let Some(index) = platform_index {
        let platform = platforms
            .get(index)
            .cloned()
            .ok_or(DiscoveryError::PlatformIndexOutOfRange { index, count: platforms.len() })?;
        let device = select_device(driver.as_ref(), &platform, filter)?;
        return Ok((platform, device));
    }

    for platform in platforms {
        match select_device(driver.as_ref(), &platform, filter) {
            Ok(device) => return Ok((platform, device)),
            Err(DiscoveryError::NoDeviceFound { .. }) => {
                debug!(platform = %platform.name, %filter, "no matching device on platform");
            }
            Err(e) => return Err(e),
        }
    }
    Err(DiscoveryError::NoDeviceFound { filter })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DeviceSpec, PlatformSpec, ReferenceDriver};

    fn two_platform_driver() -> Arc<dyn Driver> {
        Arc::new(
            ReferenceDriver::builder()
                .platform(PlatformSpec::new("Alpha").device(DeviceSpec::cpu("alpha-cpu")))
                .platform(
                    PlatformSpec::new("Beta")
                        .device(DeviceSpec::gpu("beta-gpu0"))
                        .device(DeviceSpec::gpu("beta-gpu1")),
                )
                .build(),
        )
    }

    #[test]
    fn device_type_parses_unions() {
        let mask: DeviceType = "cpu,gpu".parse().unwrap();
        assert_eq!(mask, DeviceType::CPU | DeviceType::GPU);
        let mask: DeviceType = "GPU | accelerator".parse().unwrap();
        assert_eq!(mask, DeviceType::GPU | DeviceType::ACCELERATOR);
        assert_eq!("all".parse::<DeviceType>().unwrap(), DeviceType::ALL);
    }

    #[test]
    fn device_type_rejects_unknown_and_empty() {
        assert!("fpga".parse::<DeviceType>().is_err());
        assert!("".parse::<DeviceType>().is_err());
    }

    #[test]
    fn device_type_display_lists_flags() {
        assert_eq!((DeviceType::GPU | DeviceType::DEFAULT).to_string(), "DEFAULT GPU");
        assert_eq!(DeviceType::ALL.to_string(), "ALL");
        let parsed: DeviceType = (DeviceType::CPU | DeviceType::CUSTOM).to_string().parse().unwrap();
        assert_eq!(parsed, DeviceType::CPU | DeviceType::CUSTOM);
    }

    #[test]
    fn platforms_iterator_is_not_restartable() {
        let driver = two_platform_driver();
        let mut platforms = list_platforms(&driver);
        assert_eq!(platforms.next().unwrap().unwrap().name, "Alpha");
        assert_eq!(platforms.next().unwrap().unwrap().name, "Beta");
        assert!(platforms.next().is_none());
        assert!(platforms.next().is_none());
    }

    #[test]
    fn empty_driver_reports_no_platform() {
        let driver: Arc<dyn Driver> = Arc::new(ReferenceDriver::builder().without_platforms().build());
        let mut platforms = list_platforms(&driver);
        assert!(matches!(platforms.next(), Some(Err(DiscoveryError::NoPlatformFound))));
        assert!(platforms.next().is_none());
    }

    #[test]
    fn select_first_device_tie_breaks_on_enumeration_order() {
        let driver = two_platform_driver();
        let (platform, device) = select_first_device(&driver, DeviceType::GPU, None).unwrap();
        assert_eq!(platform.name, "Beta");
        assert_eq!(device.name, "beta-gpu0");
    }

    #[test]
    fn select_first_device_honours_platform_index() {
        let driver = two_platform_driver();
        let err = select_first_device(&driver, DeviceType::GPU, Some(0)).unwrap_err();
        assert!(matches!(err, DiscoveryError::NoDeviceFound { .. }));
        let err = select_first_device(&driver, DeviceType::GPU, Some(7)).unwrap_err();
        assert!(matches!(err, DiscoveryError::PlatformIndexOutOfRange { index: 7, count: 2 }));
    }

    #[test]
    fn accelerator_filter_matches_nothing() {
        let driver = two_platform_driver();
        let err = select_first_device(&driver, DeviceType::ACCELERATOR, None).unwrap_err();
        assert!(err.to_string().contains("ACCELERATOR"));
    }
}
