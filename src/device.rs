//! Device identification heuristics.
//!
//! A device model is discovered by probing the board mapping table in a
//! fixed order; the first stage that produces a match wins. The family is
//! a lookup on the discovered model (with optional variant aliasing), and
//! the UID prefers the modem IMEI with narrow fallbacks.

use std::fs;
use std::path::Path;

use log::debug;

use crate::config::ConfigStore;

/// Model reported when no probe stage matches.
pub const UNKNOWN: &str = "UNKNOWN";

/// Default location of the kernel CPU description.
pub const CPUINFO_PATH: &str = "/proc/cpuinfo";

const DMI_PRODUCT_NAME: &str = "/sys/devices/virtual/dmi/id/product_name";
const MACHINE_ID_PATH: &str = "/etc/machine-id";

/// Environment variable consulted for the IMEI on modem-less boot stages
/// of the n950-n9 and n900 families.
const IMEI_ENV: &str = "imei";

/// Hardware information sources the identification pipeline consults.
///
/// The host implementation reads the usual Linux locations; tests inject
/// a fake to exercise each probe stage deterministically.
pub trait Platform {
    /// Modem IMEI, empty when no modem is available.
    fn imei(&self) -> String;

    /// System-information model string (DMI product name on PCs).
    fn model_name(&self) -> String;

    /// Machine-scoped unique identifier used as the last-resort UID.
    fn unique_device_id(&self) -> String;
}

/// [`Platform`] backed by the host filesystem.
pub struct HostPlatform;

impl Platform for HostPlatform {
    fn imei(&self) -> String {
        String::new()
    }

    fn model_name(&self) -> String {
        read_trimmed(Path::new(DMI_PRODUCT_NAME))
    }

    fn unique_device_id(&self) -> String {
        read_trimmed(Path::new(MACHINE_ID_PATH))
    }
}

fn read_trimmed(path: &Path) -> String {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Probe the board mapping for the device model.
///
/// Stages, first non-empty match wins:
/// 1. `file.exists` - a marker path exists on the filesystem
/// 2. `systeminfo.equals` - the platform model string matches exactly
/// 3. `cpuinfo.contains` - `/proc/cpuinfo` contains a substring
/// 4. `arch.equals` - the configured architecture matches exactly
///
/// Falls back to [`UNKNOWN`]. Keys within a stage are visited in
/// lexicographic order.
pub fn probe_model(
    board: &ConfigStore,
    arch: &str,
    platform: &dyn Platform,
    cpuinfo_path: &Path,
) -> String {
    for key in board.keys("file.exists") {
        let value = board.get("file.exists", &key).unwrap_or_default();
        if Path::new(value).exists() {
            debug!("model {} matched by file {}", key, value);
            return key;
        }
    }

    let model_name = platform.model_name();
    for key in board.keys("systeminfo.equals") {
        let value = board.get("systeminfo.equals", &key).unwrap_or_default();
        if model_name == value {
            debug!("model {} matched by system information", key);
            return key;
        }
    }

    if let Ok(cpuinfo) = fs::read_to_string(cpuinfo_path) {
        for key in board.keys("cpuinfo.contains") {
            let value = board.get("cpuinfo.contains", &key).unwrap_or_default();
            if !value.is_empty() && cpuinfo.contains(value) {
                debug!("model {} matched by cpuinfo", key);
                return key;
            }
        }
    }

    // Generic fallback on the architecture, mostly useful for x86 targets.
    for key in board.keys("arch.equals") {
        let value = board.get("arch.equals", &key).unwrap_or_default();
        if arch == value {
            debug!("model {} matched by arch", key);
            return key;
        }
    }

    UNKNOWN.to_string()
}

/// Resolve the device family for a model.
///
/// A `variants` entry aliases the model first; the family then comes from
/// the `[<model>] family=` entry, defaulting to [`UNKNOWN`].
pub fn family_for(board: &ConfigStore, model: &str) -> String {
    let model = board.get("variants", model).unwrap_or(model);
    board
        .get(model, "family")
        .unwrap_or(UNKNOWN)
        .to_string()
}

/// Compute the device UID.
///
/// The modem IMEI wins when present. Without one, the n950-n9 and n900
/// families may carry the IMEI in the `imei` environment variable, which
/// is accepted only if it is a base-10 integer of 15 or 16 digits. Every
/// other family falls back to the platform unique device id. The result
/// may be empty; callers treat an empty UID as an error.
pub fn device_uid(family: &str, platform: &dyn Platform) -> String {
    let imei = platform.imei();
    if !imei.is_empty() {
        return imei;
    }

    if family == "n950-n9" || family == "n900" {
        if let Ok(env_imei) = std::env::var(IMEI_ENV)
            && env_imei.parse::<i64>().is_ok()
            && (env_imei.len() == 15 || env_imei.len() == 16)
        {
            return env_imei;
        }
        String::new()
    } else {
        platform.unique_device_id()
    }
}
