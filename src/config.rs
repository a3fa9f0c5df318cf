// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Platform description: the firmware-provided facts the host needs to set up device isolation.

use std::fs;
use std::io;
use std::path::Path;

use remain::sorted;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::addr::HypVaLayout;

#[sorted]
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read platform config {0}: {1}")]
    Io(String, io::Error),
    #[error("failed to parse platform config: {0}")]
    Parse(serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// A reserved-memory node describing the IOMMU CMA region.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReservedMemConfig {
    pub name: String,
    pub base: u64,
    pub size: u64,
}

/// One MMIO register window of a device.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegConfig {
    pub base: u64,
    pub size: u64,
}

/// A device's upstream IOMMU, named by its firmware node, and the endpoint it uses there.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceIommuConfig {
    pub node: String,
    pub endpoint: u64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    #[serde(default)]
    pub name: String,
    /// Devices sharing a group id are handed to a guest together.
    #[serde(default)]
    pub group_id: u32,
    #[serde(default)]
    pub regs: Vec<RegConfig>,
    #[serde(default)]
    pub iommus: Vec<DeviceIommuConfig>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlatformConfig {
    #[serde(default)]
    pub hyp_va: HypVaLayout,
    #[serde(default)]
    pub iommu_cma: Option<ReservedMemConfig>,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl PlatformConfig {
    pub fn from_json_str(s: &str) -> Result<PlatformConfig> {
        serde_json::from_str(s).map_err(ConfigError::Parse)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<PlatformConfig> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
        PlatformConfig::from_json_str(&contents)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    const SAMPLE: &str = r#"{
        "iommu_cma": { "name": "pkvm-iommu-cma", "base": 2147483648, "size": 33554432 },
        "devices": [
            {
                "name": "gpu",
                "group_id": 1,
                "regs": [ { "base": 4096, "size": 8192 } ],
                "iommus": [ { "node": "smmu0", "endpoint": 3 } ]
            },
            { "regs": [ { "base": 65536, "size": 4096 } ] }
        ]
    }"#;

    #[test]
    fn parse_sample() {
        let cfg = PlatformConfig::from_json_str(SAMPLE).unwrap();
        assert_eq!(cfg.hyp_va, HypVaLayout::default());
        let cma = cfg.iommu_cma.as_ref().unwrap();
        assert_eq!(cma.name, "pkvm-iommu-cma");
        assert_eq!(cma.size, 32 << 20);
        assert_eq!(cfg.devices.len(), 2);
        assert_eq!(cfg.devices[0].iommus[0].node, "smmu0");
        assert_eq!(cfg.devices[1].group_id, 0);
        assert!(cfg.devices[1].iommus.is_empty());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let res = PlatformConfig::from_json_str(r#"{ "devices": [], "bogus": 1 }"#);
        assert!(matches!(res, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let cfg = PlatformConfig::load(file.path()).unwrap();
        assert_eq!(cfg.devices[0].regs[0].size, 8192);

        let missing = file.path().with_extension("missing");
        assert!(matches!(
            PlatformConfig::load(missing),
            Err(ConfigError::Io(..))
        ));
    }
}
