// Copyright 2020 CoreOS, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;

/// Arbitrary value tree for `manifest_passthrough` and multi-NIC
/// passthrough subtrees: survives to the formatter boundary without loss.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum PassthroughValue {
    Scalar(String),
    List(Vec<PassthroughValue>),
    Map(BTreeMap<String, PassthroughValue>),
}

/// A single network interface configuration.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NicConfig {
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub net_mask: String,
    #[serde(default)]
    pub gateway: String,
}

/// Output image naming and runtime network configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_image_name")]
    pub image_name: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub ipv6_address: String,
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub net_mask: String,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub nics: Vec<NicConfig>,
}

fn default_image_name() -> String {
    "image".to_string()
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            image_name: default_image_name(),
            ip_address: String::new(),
            ipv6_address: String::new(),
            gateway: String::new(),
            net_mask: String::new(),
            ports: Vec::new(),
            nics: Vec::new(),
        }
    }
}

/// User-supplied build configuration (§3.1). Immutable for the duration of
/// a build.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub disable_args_copy: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub dirs: Vec<String>,
    #[serde(default)]
    pub map_dirs: BTreeMap<String, String>,
    #[serde(default)]
    pub mounts: BTreeMap<String, String>,
    #[serde(default)]
    pub klibs: Vec<String>,
    #[serde(default)]
    pub klib_dir: Option<String>,
    #[serde(default)]
    pub kernel: String,
    #[serde(default)]
    pub debug_flags: Vec<String>,
    #[serde(default)]
    pub reboot_on_exit: bool,
    #[serde(default)]
    pub no_trace: Vec<String>,
    #[serde(default)]
    pub name_servers: Vec<String>,
    #[serde(default)]
    pub manifest_passthrough: BTreeMap<String, PassthroughValue>,
    #[serde(default)]
    pub run_config: RunConfig,
    #[serde(default)]
    pub target_root: String,
    #[serde(default)]
    pub base_volume_sz: Option<String>,
    #[serde(default)]
    pub boot: Option<String>,
    #[serde(default)]
    pub uefi: bool,
    #[serde(default)]
    pub uefi_boot: Option<String>,
    #[serde(default)]
    pub tfs_v4: bool,
    #[serde(default)]
    pub build_dir: Option<String>,
    #[serde(default)]
    pub show_debug: bool,
    #[serde(default)]
    pub nanos_version: String,
    #[serde(default)]
    pub nightly_build: bool,
    #[serde(default)]
    pub local_files_parent_directory: Option<String>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        Self::from_str(&data)
    }

    pub fn from_str(data: &str) -> Result<Self> {
        serde_json::from_str(data).context("parsing config JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_empty_config() {
        let cfg = Config::from_str("{}").unwrap();
        assert_eq!(cfg.program, "");
        assert_eq!(cfg.run_config.image_name, "image");
        assert!(cfg.klibs.is_empty());
    }

    #[test]
    fn passthrough_tree_roundtrips() {
        let json = r#"{"manifest_passthrough":{"firewall":{"enabled":"true","rules":["a","b"]}}}"#;
        let cfg = Config::from_str(json).unwrap();
        match cfg.manifest_passthrough.get("firewall").unwrap() {
            PassthroughValue::Map(m) => {
                assert_eq!(
                    m.get("enabled"),
                    Some(&PassthroughValue::Scalar("true".into()))
                );
                assert_eq!(
                    m.get("rules"),
                    Some(&PassthroughValue::List(vec![
                        PassthroughValue::Scalar("a".into()),
                        PassthroughValue::Scalar("b".into()),
                    ]))
                );
            }
            other => panic!("expected map, got {:?}", other),
        }
    }

    #[test]
    fn nics_parse() {
        let json = r#"{"run_config":{"nics":[{"ip_address":"10.0.0.2"},{"ip_address":"10.0.0.3"}]}}"#;
        let cfg = Config::from_str(json).unwrap();
        assert_eq!(cfg.run_config.nics.len(), 2);
        assert_eq!(cfg.run_config.nics[1].ip_address, "10.0.0.3");
    }
}
