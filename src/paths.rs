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

//! Persisted state layout (§6.5): a handle onto the per-user state
//! directory, threaded explicitly through constructors rather than kept as
//! a hidden global singleton.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Handle onto `<home>`, the per-user directory holding cached common
/// assets, kernel/klib bundles, and default image output.
#[derive(Debug, Clone)]
pub struct OpsHome {
    root: PathBuf,
}

impl OpsHome {
    /// Resolves `<home>` from the environment, defaulting to `~/.ops`.
    pub fn discover() -> Result<Self> {
        let base = dirs::home_dir().context("determining home directory")?;
        Ok(OpsHome {
            root: base.join(".ops"),
        })
    }

    /// Builds a handle rooted at an explicit path (tests, or a caller
    /// overriding the default location).
    pub fn at(root: impl Into<PathBuf>) -> Self {
        OpsHome { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<home>/common/` — extracted shared assets.
    pub fn common_dir(&self) -> PathBuf {
        self.root.join("common")
    }

    /// `<home>/common.tar.gz` — cached archive.
    pub fn common_archive(&self) -> PathBuf {
        self.root.join("common.tar.gz")
    }

    /// `<home>/images/` — default output directory for built images.
    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    /// `<home>/<nanos_version>[-nightly][-arm]/` — kernel and klib bundles.
    /// Nightly and release builds of the same version/arch are kept in
    /// separate local folders, matching the separate nightly/release
    /// download locations they're populated from.
    pub fn version_dir(&self, nanos_version: &str, nightly_build: bool, arm: bool) -> PathBuf {
        let mut name = nanos_version.to_string();
        if nightly_build {
            name.push_str("-nightly");
        }
        if arm {
            name.push_str("-arm");
        }
        self.root.join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_dir_suffixes_arm() {
        let home = OpsHome::at("/tmp/home/.ops");
        assert_eq!(
            home.version_dir("1.2", false, false),
            PathBuf::from("/tmp/home/.ops/1.2")
        );
        assert_eq!(
            home.version_dir("1.2", false, true),
            PathBuf::from("/tmp/home/.ops/1.2-arm")
        );
    }

    #[test]
    fn version_dir_suffixes_nightly() {
        let home = OpsHome::at("/tmp/home/.ops");
        assert_eq!(
            home.version_dir("1.2", true, false),
            PathBuf::from("/tmp/home/.ops/1.2-nightly")
        );
        assert_eq!(
            home.version_dir("1.2", true, true),
            PathBuf::from("/tmp/home/.ops/1.2-nightly-arm")
        );
    }

    #[test]
    fn layout_paths() {
        let home = OpsHome::at("/tmp/home/.ops");
        assert_eq!(home.common_dir(), PathBuf::from("/tmp/home/.ops/common"));
        assert_eq!(
            home.common_archive(),
            PathBuf::from("/tmp/home/.ops/common.tar.gz")
        );
        assert_eq!(home.images_dir(), PathBuf::from("/tmp/home/.ops/images"));
    }
}
