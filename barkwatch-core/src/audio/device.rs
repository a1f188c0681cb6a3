//! Audio device enumeration and selection.

use serde::{Deserialize, Serialize};

/// Metadata about an audio input device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    /// Whether this is the system default input device.
    pub is_default: bool,
    /// Heuristic flag for devices that likely capture system/output audio.
    pub is_loopback_like: bool,
}

const LOOPBACK_KEYWORDS: &[&str] = &[
    "stereo mix",
    "wave out",
    "what u hear",
    "what you hear",
    "loopback",
    "virtual output",
    "monitor of",
    "speakers (",
    "headphones (",
];

/// Best-effort heuristic for loopback/system-output capture devices.
pub fn is_loopback_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// How a preferred device name matches a discovered device.
///
/// Exact match wins over substring match; loopback-like devices are never
/// chosen by fallback, only by an explicit exact request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NameMatch {
    None,
    Substring,
    Exact,
}

/// Classify how `name` matches the `preferred` request.
pub fn match_preference(name: &str, preferred: &str) -> NameMatch {
    if name == preferred {
        return NameMatch::Exact;
    }
    if name
        .to_ascii_lowercase()
        .contains(&preferred.to_ascii_lowercase())
    {
        return NameMatch::Substring;
    }
    NameMatch::None
}

/// Pick the index of the best device for `preferred` out of `names`.
///
/// Order of preference: exact name match, case-insensitive substring match,
/// the default device, then the first non-loopback-like entry. Returns
/// `None` only when `names` is empty.
pub fn select_index(
    names: &[String],
    preferred: Option<&str>,
    default_name: Option<&str>,
) -> Option<usize> {
    if names.is_empty() {
        return None;
    }

    if let Some(preferred) = preferred {
        let mut best: Option<(NameMatch, usize)> = None;
        for (idx, name) in names.iter().enumerate() {
            let m = match_preference(name, preferred);
            if m == NameMatch::None {
                continue;
            }
            match best {
                Some((best_m, _)) if best_m >= m => {}
                _ => best = Some((m, idx)),
            }
        }
        if let Some((_, idx)) = best {
            return Some(idx);
        }
        tracing::warn!(preferred, "preferred input device not found, falling back");
    }

    if let Some(default_name) = default_name {
        if let Some(idx) = names.iter().position(|n| n == default_name) {
            if !is_loopback_like_name(&names[idx]) {
                return Some(idx);
            }
        }
    }

    names
        .iter()
        .position(|n| !is_loopback_like_name(n))
        .or(Some(0))
}

/// Linear software gain for an input percentage.
///
/// 100 maps to unity; there is no portable mixer control in this stack, so
/// the percentage only attenuates in software.
pub fn gain_for_percent(percent: u8) -> f32 {
    f32::from(percent.min(100)) / 100.0
}

/// List all available audio input devices on the system.
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    match host.input_devices() {
        Ok(devices) => devices
            .enumerate()
            .map(|(idx, device)| {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
                DeviceInfo {
                    is_default: default_name.as_deref() == Some(name.as_str()),
                    is_loopback_like: is_loopback_like_name(&name),
                    name,
                }
            })
            .collect(),
        Err(e) => {
            tracing::warn!("failed to enumerate input devices: {e}");
            Vec::new()
        }
    }
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    vec![]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn detects_common_loopback_names() {
        assert!(is_loopback_like_name("Stereo Mix (Realtek Audio)"));
        assert!(is_loopback_like_name("Monitor of Built-in Audio"));
        assert!(!is_loopback_like_name("USB Microphone Array"));
    }

    #[test]
    fn exact_match_beats_substring() {
        let devs = names(&["USB Mic", "Mic", "Stereo Mix (Realtek)"]);
        assert_eq!(select_index(&devs, Some("Mic"), None), Some(1));
    }

    #[test]
    fn substring_match_is_case_insensitive() {
        let devs = names(&["Built-in Audio", "Yeti Stereo Microphone"]);
        assert_eq!(select_index(&devs, Some("yeti"), None), Some(1));
    }

    #[test]
    fn missing_preference_falls_back_to_default() {
        let devs = names(&["A", "B", "C"]);
        assert_eq!(select_index(&devs, Some("nope"), Some("B")), Some(1));
    }

    #[test]
    fn fallback_skips_loopback_default() {
        let devs = names(&["Monitor of Built-in Audio", "USB Mic"]);
        assert_eq!(
            select_index(&devs, None, Some("Monitor of Built-in Audio")),
            Some(1)
        );
    }

    #[test]
    fn empty_list_selects_nothing() {
        assert_eq!(select_index(&[], Some("x"), None), None);
    }

    #[test]
    fn gain_percent_maps_to_unity() {
        assert!((gain_for_percent(100) - 1.0).abs() < 1e-6);
        assert!((gain_for_percent(50) - 0.5).abs() < 1e-6);
        assert!((gain_for_percent(0)).abs() < 1e-6);
    }
}
