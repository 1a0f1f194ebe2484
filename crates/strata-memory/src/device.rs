/// Memory domain a buffer lives in.
///
/// Each domain is served by its own pool inside a [`crate::MemoryManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    /// Ordinary host memory.
    Host,
    /// Accelerator memory, shared by every accelerator device.
    Accelerator,
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Domain::Host => write!(f, "host"),
            Domain::Accelerator => write!(f, "accelerator"),
        }
    }
}

/// Device enumeration for buffer allocation.
///
/// Identifies where a buffer is allocated: host memory, or the memory of the
/// accelerator with the given index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Device {
    /// Host device
    #[default]
    Host,
    /// Accelerator device with device ID
    Accelerator {
        /// The accelerator device ID
        device_id: usize,
    },
}

impl Device {
    /// Creates an accelerator device with the specified device ID.
    pub fn accelerator(device_id: usize) -> Self {
        Device::Accelerator { device_id }
    }

    /// Returns the device type as a string.
    pub fn device_type(&self) -> &str {
        match self {
            Device::Host => "host",
            Device::Accelerator { .. } => "accelerator",
        }
    }

    /// Returns the device ID if applicable.
    pub fn device_id(&self) -> Option<usize> {
        match self {
            Device::Host => None,
            Device::Accelerator { device_id } => Some(*device_id),
        }
    }

    /// Returns the memory domain whose pool serves this device.
    pub fn domain(&self) -> Domain {
        match self {
            Device::Host => Domain::Host,
            Device::Accelerator { .. } => Domain::Accelerator,
        }
    }

    /// Returns true if the device is the host.
    pub fn is_host(&self) -> bool {
        matches!(self, Device::Host)
    }

    /// Returns true if the device is an accelerator.
    pub fn is_accelerator(&self) -> bool {
        !self.is_host()
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Host => write!(f, "host"),
            Device::Accelerator { device_id } => write!(f, "accelerator:{}", device_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_host() {
        let device = Device::Host;
        assert_eq!(device.device_type(), "host");
        assert_eq!(device.device_id(), None);
        assert_eq!(device.domain(), Domain::Host);
        assert!(device.is_host());
        assert!(!device.is_accelerator());
    }

    #[test]
    fn test_device_accelerator() {
        let device = Device::accelerator(1);
        assert_eq!(device.device_type(), "accelerator");
        assert_eq!(device.device_id(), Some(1));
        assert_eq!(device.domain(), Domain::Accelerator);
        assert!(device.is_accelerator());
        assert_eq!(format!("{}", device), "accelerator:1");
    }

    #[test]
    fn test_devices_with_different_ids_differ() {
        assert_ne!(Device::accelerator(0), Device::accelerator(1));
        assert_eq!(Device::accelerator(0).domain(), Device::accelerator(1).domain());
    }

    #[test]
    fn test_device_default() {
        assert_eq!(Device::default(), Device::Host);
    }
}
