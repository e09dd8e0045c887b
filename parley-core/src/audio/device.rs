//! Audio device enumeration and selection.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceDirection {
    Input,
    Output,
}

/// Metadata about an audio device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    /// Whether this is the system default for its direction.
    pub is_default: bool,
    pub direction: DeviceDirection,
}

/// Index of the device whose name matches `preferred`, ignoring case and
/// surrounding whitespace.
pub fn match_preferred<'a>(names: impl IntoIterator<Item = &'a str>, preferred: &str) -> Option<usize> {
    let wanted = preferred.trim();
    if wanted.is_empty() {
        return None;
    }
    names
        .into_iter()
        .position(|name| name.trim().eq_ignore_ascii_case(wanted))
}

#[cfg(feature = "audio-cpal")]
mod host {
    use cpal::traits::{DeviceTrait, HostTrait};
    use tracing::warn;

    use super::{match_preferred, DeviceDirection, DeviceInfo};
    use crate::error::{ParleyError, Result};

    /// List all input devices, default first.
    pub fn list_input_devices() -> Vec<DeviceInfo> {
        let host = cpal::default_host();
        let default_name = host.default_input_device().and_then(|d| d.name().ok());
        match host.input_devices() {
            Ok(devices) => describe(devices, default_name, DeviceDirection::Input),
            Err(e) => {
                warn!("failed to enumerate input devices: {e}");
                Vec::new()
            }
        }
    }

    /// List all output devices, default first.
    pub fn list_output_devices() -> Vec<DeviceInfo> {
        let host = cpal::default_host();
        let default_name = host.default_output_device().and_then(|d| d.name().ok());
        match host.output_devices() {
            Ok(devices) => describe(devices, default_name, DeviceDirection::Output),
            Err(e) => {
                warn!("failed to enumerate output devices: {e}");
                Vec::new()
            }
        }
    }

    fn describe(
        devices: impl Iterator<Item = cpal::Device>,
        default_name: Option<String>,
        direction: DeviceDirection,
    ) -> Vec<DeviceInfo> {
        let mut list: Vec<DeviceInfo> = devices
            .enumerate()
            .map(|(idx, device)| {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Device {}", idx + 1));
                DeviceInfo {
                    is_default: default_name.as_deref() == Some(name.as_str()),
                    name,
                    direction,
                }
            })
            .collect();
        list.sort_by_key(|d| (!d.is_default, d.name.to_ascii_lowercase()));
        list
    }

    /// Preferred input by name, else the default, else the first available.
    pub(crate) fn select_input(host: &cpal::Host, preferred: Option<&str>) -> Result<cpal::Device> {
        let devices = host.input_devices().map(|d| d.collect()).unwrap_or_else(|e| {
            warn!("failed to list input devices while resolving preference: {e}");
            Vec::new()
        });
        pick(devices, host.default_input_device(), preferred, DeviceDirection::Input)
            .ok_or(ParleyError::NoDefaultInputDevice)
    }

    /// Preferred output by name, else the default, else the first available.
    pub(crate) fn select_output(host: &cpal::Host, preferred: Option<&str>) -> Result<cpal::Device> {
        let devices = host.output_devices().map(|d| d.collect()).unwrap_or_else(|e| {
            warn!("failed to list output devices while resolving preference: {e}");
            Vec::new()
        });
        pick(devices, host.default_output_device(), preferred, DeviceDirection::Output)
            .ok_or(ParleyError::NoDefaultOutputDevice)
    }

    fn pick(
        devices: Vec<cpal::Device>,
        default: Option<cpal::Device>,
        preferred: Option<&str>,
        direction: DeviceDirection,
    ) -> Option<cpal::Device> {
        if let Some(preferred) = preferred {
            let names: Vec<String> = devices
                .iter()
                .map(|d| d.name().unwrap_or_default())
                .collect();
            if let Some(idx) = match_preferred(names.iter().map(String::as_str), preferred) {
                return devices.into_iter().nth(idx);
            }
            warn!(?direction, "preferred device '{preferred}' not found, falling back");
        }

        if default.is_some() {
            return default;
        }
        warn!(?direction, "no default device, falling back to first available");
        devices.into_iter().next()
    }
}

#[cfg(feature = "audio-cpal")]
pub use host::{list_input_devices, list_output_devices};

#[cfg(feature = "audio-cpal")]
pub(crate) use host::{select_input, select_output};

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    vec![]
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    vec![]
}

#[cfg(test)]
mod tests {
    use super::match_preferred;

    #[test]
    fn preferred_name_matches_case_insensitively() {
        let names = ["Built-in Microphone", "USB Headset"];
        assert_eq!(match_preferred(names, "  usb headset "), Some(1));
    }

    #[test]
    fn unknown_or_blank_preference_matches_nothing() {
        let names = ["Built-in Microphone"];
        assert_eq!(match_preferred(names, "Yeti"), None);
        assert_eq!(match_preferred(names, "   "), None);
    }
}
