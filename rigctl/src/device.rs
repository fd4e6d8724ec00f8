//! Device classification and selector labels.
//!
//! The rig's Master and Target boards enumerate as USB CDC ports, either through
//! the nRF52840's native USB (Nordic / Adafruit / Seeed bootloaders) or through a
//! USB-UART bridge. Classification is only used for display and for ordering
//! candidates in interactive selection; the core never filters on it.

use crate::port::{PortEnumerator, PortInfo};
use log::{debug, trace};

/// Known USB device kinds seen on the rig.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Nordic Semiconductor native USB (nRF52840 application or DFU bootloader).
    Nordic,
    /// Adafruit nRF52 bootloader / CircuitPython-class boards.
    Adafruit,
    /// Seeed Studio XIAO nRF52840.
    Seeed,
    /// SEGGER J-Link virtual COM port.
    Segger,
    /// CH340/CH341 USB-to-Serial converter.
    Ch340,
    /// Silicon Labs CP210x USB-to-Serial converter.
    Cp210x,
    /// FTDI FT232/FT2232/FT4232 USB-to-Serial converter.
    Ftdi,
    /// Prolific PL2303 USB-to-Serial converter.
    Prolific,
    /// Unknown device.
    Unknown,
}

/// Known USB VID/PID pairs. An empty PID list matches any product.
const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (0x1915, &[], DeviceKind::Nordic),
    (0x239A, &[], DeviceKind::Adafruit),
    (0x2886, &[], DeviceKind::Seeed),
    (0x1366, &[], DeviceKind::Segger),
    (
        0x1A86,
        &[0x7523, 0x7522, 0x5523, 0x55D4],
        DeviceKind::Ch340,
    ),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71], DeviceKind::Cp210x),
    (
        0x0403,
        &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015],
        DeviceKind::Ftdi,
    ),
    (0x067B, &[0x2303, 0x23A3, 0x23C3, 0x23D3], DeviceKind::Prolific),
];

impl DeviceKind {
    /// Classify a VID/PID combination.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        for (known_vid, pids, device) in KNOWN_USB_DEVICES {
            if vid == *known_vid && (pids.is_empty() || pids.contains(&pid)) {
                return *device;
            }
        }
        Self::Unknown
    }

    /// Get a human-readable name for the device kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Nordic => "Nordic",
            Self::Adafruit => "Adafruit nRF52",
            Self::Seeed => "Seeed nRF52",
            Self::Segger => "J-Link VCOM",
            Self::Ch340 => "CH340/CH341",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Prolific => "PL2303",
            Self::Unknown => "Unknown",
        }
    }

    /// Check if this is a known/expected device kind.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Native-USB nRF52 boards sort ahead of bridges during selection.
    pub fn is_high_priority(&self) -> bool {
        matches!(self, Self::Nordic | Self::Adafruit | Self::Seeed)
    }
}

/// Discovered port with classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedPort {
    /// Raw port information.
    pub info: PortInfo,
    /// Classified device kind.
    pub device: DeviceKind,
}

impl DetectedPort {
    /// Classify an enumerated port.
    pub fn classify(info: PortInfo) -> Self {
        let device = match (info.vid, info.pid) {
            (Some(vid), Some(pid)) => DeviceKind::from_vid_pid(vid, pid),
            _ => DeviceKind::Unknown,
        };
        Self { info, device }
    }

    /// Device identifier (e.g. "COM5" or "/dev/ttyACM0").
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Selector label: `"COM5 (description)"`, or the bare name without one.
    pub fn label(&self) -> String {
        let description = self
            .info
            .product
            .as_deref()
            .or(self.info.manufacturer.as_deref())
            .filter(|d| !d.is_empty());
        match description {
            Some(d) => format!("{} ({d})", self.info.name),
            None => self.info.name.clone(),
        }
    }
}

/// Enumerate and classify ports, high-priority kinds first, otherwise by name.
pub fn detect_ports(enumerator: &dyn PortEnumerator) -> Vec<DetectedPort> {
    let mut ports: Vec<DetectedPort> = match enumerator.list_ports() {
        Ok(ports) => ports.into_iter().map(DetectedPort::classify).collect(),
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            Vec::new()
        },
    };

    for port in &ports {
        trace!("Found port: {} ({:?})", port.info.name, port.device);
    }

    ports.sort_by(|a, b| {
        b.device
            .is_high_priority()
            .cmp(&a.device.is_high_priority())
            .then_with(|| a.info.name.cmp(&b.info.name))
    });
    ports
}

/// Extract the device identifier from a selector label.
///
/// `"COM5 (USB Serial Device)"` yields `"COM5"`. Empty labels and placeholders
/// such as `"<no ports detected>"` yield `None`.
pub fn device_from_label(label: &str) -> Option<String> {
    let label = label.trim();
    let device = match label.split_once(" (") {
        Some((device, _)) => device.trim(),
        None => label,
    };
    if device.is_empty() || device.starts_with('<') {
        None
    } else {
        Some(device.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::ScriptedEnumerator;

    #[test]
    fn test_device_kind_from_vid_pid() {
        assert_eq!(DeviceKind::from_vid_pid(0x1915, 0x521F), DeviceKind::Nordic);
        assert_eq!(DeviceKind::from_vid_pid(0x239A, 0x0029), DeviceKind::Adafruit);
        assert_eq!(DeviceKind::from_vid_pid(0x1A86, 0x7523), DeviceKind::Ch340);
        assert_eq!(DeviceKind::from_vid_pid(0x10C4, 0xEA60), DeviceKind::Cp210x);
        assert_eq!(DeviceKind::from_vid_pid(0x0403, 0x6001), DeviceKind::Ftdi);
        assert_eq!(DeviceKind::from_vid_pid(0x067B, 0x2303), DeviceKind::Prolific);
        assert_eq!(DeviceKind::Prolific.name(), "PL2303");
        assert!(!DeviceKind::Prolific.is_high_priority());
        assert_eq!(DeviceKind::from_vid_pid(0x1A86, 0x0001), DeviceKind::Unknown);
        assert_eq!(DeviceKind::from_vid_pid(0x1234, 0x5678), DeviceKind::Unknown);
    }

    #[test]
    fn test_label_prefers_product() {
        let port = DetectedPort::classify(PortInfo {
            name: "COM5".into(),
            vid: Some(0x239A),
            pid: Some(0x0029),
            manufacturer: Some("Adafruit".into()),
            product: Some("Feather nRF52840".into()),
            serial_number: None,
        });
        assert_eq!(port.label(), "COM5 (Feather nRF52840)");
        assert_eq!(port.device, DeviceKind::Adafruit);

        let bare = DetectedPort::classify(PortInfo::named("/dev/ttyS0"));
        assert_eq!(bare.label(), "/dev/ttyS0");
        assert_eq!(bare.device, DeviceKind::Unknown);
    }

    #[test]
    fn test_device_from_label() {
        assert_eq!(device_from_label("COM5 (USB Serial Device)").as_deref(), Some("COM5"));
        assert_eq!(device_from_label("  /dev/ttyACM0 ").as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(device_from_label("<no ports detected>"), None);
        assert_eq!(device_from_label(""), None);
    }

    #[test]
    fn test_detect_ports_sorted_by_name_without_usb_info() {
        let enumerator = ScriptedEnumerator::new(&[&["COM9", "COM3"]]);
        let ports = detect_ports(&enumerator);
        let names: Vec<&str> = ports.iter().map(DetectedPort::name).collect();
        assert_eq!(names, vec!["COM3", "COM9"]);
    }
}
