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

//! Orchestrator (component F): the only entry point. Wires A–E end to
//! end and guarantees `build_dir` cleanup on every exit path.

use crate::assembler::assemble;
use crate::config::Config;
use crate::manifest::Manifest;
use crate::paths::OpsHome;
use crate::writer::{write_image, MkfsCommand, WriteOptions};
use anyhow::{Context, Result};
use std::path::Path;

fn cleanup(temp_dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(temp_dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            eprintln!("cleaning up {}: {}", temp_dir.display(), e);
        }
    }
}

fn write_options_from_config(config: &Config, arm: bool) -> WriteOptions {
    WriteOptions {
        output_path: Path::new(&config.run_config.image_name).to_path_buf(),
        file_system_size: config.base_volume_sz.clone(),
        boot_path: config.boot.as_ref().map(Path::new).unwrap_or(Path::new("")).to_path_buf(),
        uefi: config.uefi,
        uefi_boot: config.uefi_boot.as_ref().map(Path::new).map(Path::to_path_buf),
        arm,
        old_encoding: !config.tfs_v4,
        show_debug: config.show_debug,
    }
}

/// Runs the host-build flow (§4.4 non-package path), writes the image
/// (§4.5), then always removes `build_dir`.
pub fn build_image(config: &Config, home: &OpsHome, formatter: &mut dyn MkfsCommand) -> Result<Manifest> {
    run(config, None, home, formatter)
}

/// Runs the package-build flow (§4.4 package path), writes the image,
/// then always removes `build_dir`.
pub fn build_image_from_package(
    pkg_path: &Path,
    config: &Config,
    home: &OpsHome,
    formatter: &mut dyn MkfsCommand,
) -> Result<Manifest> {
    run(config, Some(pkg_path), home, formatter)
}

fn run(
    config: &Config,
    package_path: Option<&Path>,
    home: &OpsHome,
    formatter: &mut dyn MkfsCommand,
) -> Result<Manifest> {
    let (manifest, ctx) = assemble(config, package_path, home).context("assembling manifest")?;
    let temp_dir = ctx.temp_dir.path().to_path_buf();

    let result = (|| -> Result<()> {
        let options = write_options_from_config(config, ctx.arm);
        write_image(&manifest, &options, formatter).context("writing image")
    })();

    cleanup(&temp_dir);
    result?;
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;

    struct NoopFormatter;
    impl MkfsCommand for NoopFormatter {
        fn file_system_size(&mut self, _size: &str) -> &mut dyn MkfsCommand {
            self
        }
        fn boot(&mut self, _path: &Path) -> &mut dyn MkfsCommand {
            self
        }
        fn uefi(&mut self, _path: &Path) -> &mut dyn MkfsCommand {
            self
        }
        fn file_system_path(&mut self, _path: &Path) -> &mut dyn MkfsCommand {
            self
        }
        fn old_encoding(&mut self, _enabled: bool) -> &mut dyn MkfsCommand {
            self
        }
        fn execute(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn seed_common(home: &OpsHome) {
        use crate::archive::create_archive;
        use maplit::btreemap;
        let staging = tempfile::tempdir().unwrap();
        std::fs::write(staging.path().join("ca-certificates.crt"), b"ca").unwrap();
        let files = btreemap! {
            "ca-certificates.crt".to_string() => staging.path().join("ca-certificates.crt"),
        };
        std::fs::create_dir_all(home.root()).unwrap();
        create_archive(home.common_archive(), &files).unwrap();
    }

    #[test]
    fn build_dir_removed_after_success() {
        let tmp = tempfile::tempdir().unwrap();
        let home = OpsHome::at(tmp.path());
        seed_common(&home);
        let program = tempfile::NamedTempFile::new().unwrap();
        crate::sharedlibs::write_minimal_elf(program.path()).unwrap();
        let build_dir = tempfile::tempdir().unwrap();

        let mut config = Config::default();
        config.program = program.path().to_string_lossy().to_string();
        config.build_dir = Some(build_dir.path().to_string_lossy().to_string());
        config.run_config = RunConfig {
            image_name: build_dir.path().join("out.img").to_string_lossy().to_string(),
            ..Default::default()
        };

        let mut formatter = NoopFormatter;
        let manifest = build_image(&config, &home, &mut formatter).unwrap();
        assert!(manifest.program().is_some());

        let leftover = std::fs::read_dir(build_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with("uniboot-build-"));
        assert!(!leftover, "build_dir should be removed after build_image returns");
    }

    #[test]
    fn build_dir_removed_after_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let home = OpsHome::at(tmp.path());
        seed_common(&home);
        let program = tempfile::NamedTempFile::new().unwrap();
        crate::sharedlibs::write_minimal_elf(program.path()).unwrap();
        let build_dir = tempfile::tempdir().unwrap();

        let mut config = Config::default();
        config.program = program.path().to_string_lossy().to_string();
        config.build_dir = Some(build_dir.path().to_string_lossy().to_string());
        // uefi requested with no loader path: writer.rs fails before any write.
        config.uefi = true;

        let mut formatter = NoopFormatter;
        let result = build_image(&config, &home, &mut formatter);
        assert!(result.is_err());

        let leftover = std::fs::read_dir(build_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with("uniboot-build-"));
        assert!(!leftover, "build_dir should be removed even when the build fails");
    }
}
