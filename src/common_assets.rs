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

//! Common-asset provisioner (component A): ensures a host-local cache of
//! shared assets (TLS root bundle, DNS resolver library) exists, then
//! stages what's relevant into the manifest.

use crate::archive::extract_archive;
use crate::download::download;
use crate::manifest::Manifest;
use crate::paths::OpsHome;
use anyhow::{Context, Result};

const COMMON_ASSETS_URL: &str = "https://storage.googleapis.com/nanos-common/common.tar.gz";
const DOWNLOAD_TIMEOUT_SECONDS: u64 = 120;

const DNS_LIB_NAME: &str = "libnss_dns.so.2";
const CA_CERTS_NAME: &str = "ca-certificates.crt";
const GUEST_DNS_LIB_PATH: &str = "/lib/x86_64-linux-gnu/libnss_dns.so.2";
const GUEST_CA_CERTS_PATH: &str = "/etc/ssl/certs/ca-certificates.crt";

/// Ensures `<home>/common` is populated (downloading+extracting
/// `<home>/common.tar.gz` first if needed), then stages the DNS resolver
/// library (unless `arm`) and CA bundle into `manifest` when present.
/// Files missing after a successful extraction are tolerated, so newer
/// archives can drop assets without breaking older callers.
pub fn ensure_common(home: &OpsHome, arm: bool, manifest: &mut Manifest) -> Result<()> {
    let common_dir = home.common_dir();
    let archive_path = home.common_archive();

    if !archive_path.exists() {
        eprintln!("downloading common assets");
        download(COMMON_ASSETS_URL, &archive_path, DOWNLOAD_TIMEOUT_SECONDS, true, None)
            .context("downloading common assets archive")?;
    }

    if !common_dir.exists() || std::fs::read_dir(&common_dir)?.next().is_none() {
        extract_archive(&archive_path, &common_dir).context("extracting common assets archive")?;
    }

    if !arm {
        let dns_lib = common_dir.join(DNS_LIB_NAME);
        if dns_lib.is_file() {
            manifest.add_file(GUEST_DNS_LIB_PATH, dns_lib)?;
        }
    }

    let ca_certs = common_dir.join(CA_CERTS_NAME);
    if ca_certs.is_file() {
        manifest.add_file(GUEST_CA_CERTS_PATH, ca_certs)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::create_archive;
    use maplit::btreemap;

    fn seed_archive(home: &OpsHome) {
        let staging = tempfile::tempdir().unwrap();
        std::fs::write(staging.path().join(DNS_LIB_NAME), b"dns").unwrap();
        std::fs::write(staging.path().join(CA_CERTS_NAME), b"ca").unwrap();
        let files = btreemap! {
            DNS_LIB_NAME.to_string() => staging.path().join(DNS_LIB_NAME),
            CA_CERTS_NAME.to_string() => staging.path().join(CA_CERTS_NAME),
        };
        std::fs::create_dir_all(home.root()).unwrap();
        create_archive(home.common_archive(), &files).unwrap();
    }

    #[test]
    fn stages_dns_and_ca_when_present_and_not_arm() {
        let tmp = tempfile::tempdir().unwrap();
        let home = OpsHome::at(tmp.path());
        seed_archive(&home);

        let mut manifest = Manifest::new();
        ensure_common(&home, false, &mut manifest).unwrap();
        assert!(manifest.file_exists(GUEST_DNS_LIB_PATH));
        assert!(manifest.file_exists(GUEST_CA_CERTS_PATH));
    }

    #[test]
    fn skips_dns_lib_on_arm() {
        let tmp = tempfile::tempdir().unwrap();
        let home = OpsHome::at(tmp.path());
        seed_archive(&home);

        let mut manifest = Manifest::new();
        ensure_common(&home, true, &mut manifest).unwrap();
        assert!(!manifest.file_exists(GUEST_DNS_LIB_PATH));
        assert!(manifest.file_exists(GUEST_CA_CERTS_PATH));
    }
}
