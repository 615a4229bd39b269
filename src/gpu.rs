//! GPU selection for containers run through the NVIDIA container toolkit.
//!
//! Mirrors the values the docker cli accepts for `--gpus`.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Which GPUs a container may use
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GpuSelection {
    /// every GPU on the host
    All,
    /// any `n` GPUs
    Count(u32),
    /// specific GPUs by index or UUID
    Devices(Vec<String>),
}

impl GpuSelection {
    /// Parses `all`, `count=N`, `device=0,1` or a bare id list such as `0,1`
    pub fn parse(spec: &str) -> Result<GpuSelection> {
        let invalid = || Error::InvalidGpuSpec(spec.to_owned());
        let trimmed = spec.trim().trim_matches('"');

        if trimmed.eq_ignore_ascii_case("all") || trimmed.eq_ignore_ascii_case("count=all") {
            return Ok(GpuSelection::All);
        }
        if let Some(count) = trimmed.strip_prefix("count=") {
            return count
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .map(GpuSelection::Count)
                .ok_or_else(invalid);
        }

        let ids = trimmed.strip_prefix("device=").unwrap_or(trimmed);
        let devices = ids
            .split(',')
            .map(str::trim)
            .map(str::to_owned)
            .collect::<Vec<_>>();
        if devices.iter().any(|d| d.is_empty() || d.contains(char::is_whitespace)) {
            return Err(invalid());
        }
        Ok(GpuSelection::Devices(devices))
    }

    /// Renders the selection as a request for the runtime's GPU device driver
    pub fn device_request(&self) -> DeviceRequest {
        let (count, device_ids) = match self {
            GpuSelection::All => (Some(-1), None),
            GpuSelection::Count(n) => (Some(i64::from(*n)), None),
            GpuSelection::Devices(ids) => (None, Some(ids.clone())),
        };
        DeviceRequest {
            driver: String::new(),
            count,
            device_ids,
            capabilities: vec![vec!["gpu".to_owned()]],
        }
    }
}

impl FromStr for GpuSelection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        GpuSelection::parse(s)
    }
}

impl fmt::Display for GpuSelection {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        match self {
            GpuSelection::All => write!(f, "all"),
            GpuSelection::Count(n) => write!(f, "count={}", n),
            GpuSelection::Devices(ids) => write!(f, "device={}", ids.join(",")),
        }
    }
}

/// A request for devices to be sent to device drivers
///
/// API Reference: <https://docs.docker.com/engine/api/v1.41/#operation/ContainerCreate>
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceRequest {
    pub driver: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
    #[serde(rename = "DeviceIDs", skip_serializing_if = "Option::is_none")]
    pub device_ids: Option<Vec<String>>,
    pub capabilities: Vec<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_all() {
        assert_eq!(GpuSelection::parse("all").unwrap(), GpuSelection::All);
        assert_eq!(GpuSelection::parse(" ALL ").unwrap(), GpuSelection::All);
    }

    #[test]
    fn parses_device_ids() {
        let expected = GpuSelection::Devices(vec!["0".into(), "1".into()]);
        assert_eq!(GpuSelection::parse("0,1").unwrap(), expected);
        assert_eq!(GpuSelection::parse("device=0,1").unwrap(), expected);
        assert_eq!(GpuSelection::parse(r#""device=0, 1""#).unwrap(), expected);
        assert_eq!(
            GpuSelection::parse("GPU-3a23c669").unwrap(),
            GpuSelection::Devices(vec!["GPU-3a23c669".into()])
        );
    }

    #[test]
    fn parses_count() {
        assert_eq!(GpuSelection::parse("count=2").unwrap(), GpuSelection::Count(2));
        assert!(GpuSelection::parse("count=0").is_err());
        assert!(GpuSelection::parse("count=two").is_err());
    }

    #[test]
    fn rejects_empty_ids() {
        for spec in &["", "0,,1", "device=", "0,"] {
            match GpuSelection::parse(spec) {
                Err(Error::InvalidGpuSpec(s)) => assert_eq!(s, *spec),
                other => panic!("expected InvalidGpuSpec for {:?}, got {:?}", spec, other),
            }
        }
    }

    #[test]
    fn all_requests_every_gpu() {
        assert_eq!(
            serde_json::to_value(GpuSelection::All.device_request()).unwrap(),
            json!({"Driver": "", "Count": -1, "Capabilities": [["gpu"]]})
        );
    }

    #[test]
    fn count_requests_that_many_gpus() {
        let request = GpuSelection::parse("count=2").unwrap().device_request();
        assert_eq!(
            serde_json::to_value(request).unwrap(),
            json!({"Driver": "", "Count": 2, "Capabilities": [["gpu"]]})
        );
    }

    #[test]
    fn ids_request_specific_devices() {
        let request = GpuSelection::parse("0,1").unwrap().device_request();
        assert_eq!(
            serde_json::to_value(request).unwrap(),
            json!({"Driver": "", "DeviceIDs": ["0", "1"], "Capabilities": [["gpu"]]})
        );
    }

    #[test]
    fn display_round_trips_through_parse() {
        let selection = GpuSelection::Devices(vec!["2".into(), "3".into()]);
        assert_eq!(selection.to_string(), "device=2,3");
        assert_eq!(selection.to_string().parse::<GpuSelection>().unwrap(), selection);
    }
}
