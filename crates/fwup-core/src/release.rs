//! Release manifests and firmware version handling.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version assumed when the device cannot report one.
pub const UNKNOWN_VERSION: &str = "0.0.0";

#[derive(Error, Debug)]
pub enum ReleaseError {
    #[error("Invalid release manifest: {0}")]
    InvalidManifest(#[from] serde_json::Error),

    #[error("Release {0} does not provide a HEX artifact for a safe update")]
    NoHexArtifact(String),
}

/// Published release description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareManifest {
    pub version: String,
    #[serde(default)]
    pub build_date: Option<String>,
    #[serde(default)]
    pub commit_short: Option<String>,
    #[serde(default)]
    pub artifacts: Artifacts,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifacts {
    #[serde(default)]
    pub firmware: Option<FirmwareArtifact>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareArtifact {
    #[serde(default)]
    pub permanent: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    /// Older manifests name the HEX file here.
    #[serde(default)]
    pub hex: Option<String>,
}

impl FirmwareManifest {
    pub fn from_json(text: &str) -> Result<Self, ReleaseError> {
        Ok(serde_json::from_str(text)?)
    }

    /// File name of the HEX artifact.
    ///
    /// Binary artifacts are never accepted: a raw image would erase the
    /// EEPROM-emulation sectors.
    pub fn hex_artifact(&self) -> Result<&str, ReleaseError> {
        let firmware = self
            .artifacts
            .firmware
            .as_ref()
            .ok_or_else(|| ReleaseError::NoHexArtifact(self.version.clone()))?;

        if let Some(permanent) = firmware.permanent.as_deref() {
            let typed_hex = firmware.kind.as_deref() == Some("hex");
            if typed_hex || is_hex_name(permanent) {
                return Ok(permanent);
            }
        }
        firmware
            .hex
            .as_deref()
            .ok_or_else(|| ReleaseError::NoHexArtifact(self.version.clone()))
    }

    /// One-line release summary.
    pub fn description(&self) -> String {
        format!(
            "Release {} (built {}, commit {})",
            self.version,
            self.build_date.as_deref().unwrap_or("unknown"),
            self.commit_short.as_deref().unwrap_or("unknown")
        )
    }
}

/// Whether a file name carries the Intel HEX extension.
pub fn is_hex_name(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(".hex")
}

/// Numeric `major.minor.patch` parts; missing or non-numeric parts are 0.
fn version_parts(version: &str) -> [u64; 3] {
    let trimmed = version.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    let mut parts = [0u64; 3];
    for (slot, piece) in parts.iter_mut().zip(trimmed.split('.')) {
        let digits: String = piece
            .trim_start()
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        *slot = digits.parse().unwrap_or(0);
    }
    parts
}

/// Whether `remote` is strictly newer than `current`.
///
/// A missing current version counts as `0.0.0`.
pub fn is_newer(remote: &str, current: Option<&str>) -> bool {
    version_parts(remote) > version_parts(current.unwrap_or(UNKNOWN_VERSION))
}

/// Extract a version from the device's reply to the version query.
///
/// Prefers `Version x.y.z`; falls back to `Firmware: g<hash>.<count>`,
/// reported as `0.0.<count>`.
pub fn parse_reported_version(response: &str) -> String {
    if let Some(version) = labelled_version(response) {
        return version;
    }
    if let Some(count) = describe_commit_count(response) {
        return format!("0.0.{}", count);
    }
    UNKNOWN_VERSION.to_string()
}

fn labelled_version(response: &str) -> Option<String> {
    response.match_indices("Version").find_map(|(at, label)| {
        let rest = &response[at + label.len()..];
        let value = rest.trim_start();
        if value.len() == rest.len() {
            return None;
        }
        let version: String = value
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        (!version.is_empty()).then_some(version)
    })
}

fn describe_commit_count(response: &str) -> Option<String> {
    response.match_indices("Firmware:").find_map(|(at, label)| {
        let rest = &response[at + label.len()..];
        let value = rest.trim_start();
        if value.len() == rest.len() {
            return None;
        }
        let hash = value.strip_prefix('g')?;
        let hash_len = hash
            .chars()
            .take_while(|c| matches!(c, '0'..='9' | 'a'..='f'))
            .count();
        if hash_len == 0 {
            return None;
        }
        let count: String = hash[hash_len..]
            .strip_prefix('.')?
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        (!count.is_empty()).then_some(count)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_newer() {
        assert!(!is_newer("1.2.3", Some("1.2.10")));
        assert!(!is_newer("2.0.0", Some("2.0.0")));
        assert!(is_newer("1.2.10", Some("1.2.3")));
        assert!(is_newer("v0.3.0", Some("0.2.9")));
        assert!(is_newer("0.0.1", None));
        assert!(is_newer("0.0.1", Some("garbage")));
        assert!(!is_newer("0.0.0", None));
        assert!(is_newer("1.0", Some("0.9.9")));
    }

    #[test]
    fn test_parse_reported_version() {
        assert_eq!(
            parse_reported_version("[INFO] [isp] Version 0.2.1 | build 2024"),
            "0.2.1"
        );
        assert_eq!(
            parse_reported_version("Firmware: g3fa9c01.42 dirty"),
            "0.0.42"
        );
        assert_eq!(parse_reported_version("ERR unknown command"), "0.0.0");
        assert_eq!(parse_reported_version("Version: 1.0"), "0.0.0");
    }

    #[test]
    fn test_hex_artifact_resolution() {
        let manifest = FirmwareManifest::from_json(
            r#"{"version":"1.4.0","build_date":"2024-05-01","commit_short":"abc123",
                "artifacts":{"firmware":{"permanent":"fw.hex","type":"hex"}}}"#,
        )
        .unwrap();
        assert_eq!(manifest.hex_artifact().unwrap(), "fw.hex");

        let legacy = FirmwareManifest::from_json(
            r#"{"version":"1.3.0","artifacts":{"firmware":{"permanent":"fw.bin","hex":"fw_legacy.hex"}}}"#,
        )
        .unwrap();
        assert_eq!(legacy.hex_artifact().unwrap(), "fw_legacy.hex");
    }

    #[test]
    fn test_binary_only_release_is_rejected() {
        let manifest = FirmwareManifest::from_json(
            r#"{"version":"1.1.0","artifacts":{"firmware":{"permanent":"fw.bin","type":"bin"}}}"#,
        )
        .unwrap();
        assert!(matches!(
            manifest.hex_artifact(),
            Err(ReleaseError::NoHexArtifact(v)) if v == "1.1.0"
        ));

        let bare = FirmwareManifest::from_json(r#"{"version":"1.0.0"}"#).unwrap();
        assert!(bare.hex_artifact().is_err());
    }
}
