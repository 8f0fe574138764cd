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

//! Image writer façade (component E): hands the populated manifest to an
//! external filesystem formatter, translating size/boot/UEFI/encoding
//! options into that formatter's builder calls. The formatter itself is
//! an opaque collaborator — the spec treats it as a black box, so this
//! module only knows its setter/terminal shape.

use crate::error::BuildError;
use crate::manifest::Manifest;
use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

/// The external "mkfs command" builder (§6.1). Implementations are
/// provided by the caller; this crate never constructs one itself.
pub trait MkfsCommand {
    fn file_system_size(&mut self, size: &str) -> &mut dyn MkfsCommand;
    fn boot(&mut self, path: &Path) -> &mut dyn MkfsCommand;
    fn uefi(&mut self, path: &Path) -> &mut dyn MkfsCommand;
    fn file_system_path(&mut self, path: &Path) -> &mut dyn MkfsCommand;
    fn old_encoding(&mut self, enabled: bool) -> &mut dyn MkfsCommand;
    fn execute(&mut self) -> Result<()>;
}

/// Options controlling how `write_image` invokes the formatter.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub output_path: PathBuf,
    pub file_system_size: Option<String>,
    pub boot_path: PathBuf,
    pub uefi: bool,
    pub uefi_boot: Option<PathBuf>,
    pub arm: bool,
    pub old_encoding: bool,
    pub show_debug: bool,
}

/// On ARM, the UEFI loader's guest-relative path is rewritten from the
/// x86_64 default to the arm64 loader location.
fn rewrite_uefi_path_for_arm(path: &Path) -> PathBuf {
    let as_str = path.to_string_lossy();
    PathBuf::from(as_str.replace("/bootx64.efi", "-arm/bootaa64.efi"))
}

/// A concrete [`MkfsCommand`] that shells out to an `mkfs`-like binary on
/// `$PATH`, the same way the rest of this crate invokes external tools
/// (see `crate::util`). A caller with an in-process formatter can
/// implement [`MkfsCommand`] directly instead of using this.
pub struct ExternalMkfsCommand {
    binary: String,
    args: Vec<String>,
}

impl ExternalMkfsCommand {
    pub fn new(binary: impl Into<String>) -> Self {
        ExternalMkfsCommand {
            binary: binary.into(),
            args: Vec::new(),
        }
    }
}

impl MkfsCommand for ExternalMkfsCommand {
    fn file_system_size(&mut self, size: &str) -> &mut dyn MkfsCommand {
        self.args.push("-s".to_string());
        self.args.push(size.to_string());
        self
    }

    fn boot(&mut self, path: &Path) -> &mut dyn MkfsCommand {
        self.args.push("-b".to_string());
        self.args.push(path.to_string_lossy().to_string());
        self
    }

    fn uefi(&mut self, path: &Path) -> &mut dyn MkfsCommand {
        self.args.push("-u".to_string());
        self.args.push(path.to_string_lossy().to_string());
        self
    }

    fn file_system_path(&mut self, path: &Path) -> &mut dyn MkfsCommand {
        self.args.push(path.to_string_lossy().to_string());
        self
    }

    fn old_encoding(&mut self, enabled: bool) -> &mut dyn MkfsCommand {
        if enabled {
            self.args.push("-e".to_string());
        }
        self
    }

    fn execute(&mut self) -> Result<()> {
        let mut cmd = std::process::Command::new(&self.binary);
        cmd.args(&self.args);
        crate::util::cmd_output(&mut cmd).map(|_| ())
    }
}

/// Invokes `formatter` with `manifest` and `options`. UEFI requested but
/// with no loader path configured fails before any formatter call is made.
pub fn write_image(
    manifest: &Manifest,
    options: &WriteOptions,
    formatter: &mut dyn MkfsCommand,
) -> Result<()> {
    if options.show_debug {
        eprintln!("manifest: {:#?}", manifest);
    }

    if options.uefi && options.uefi_boot.is_none() {
        bail!("UEFI requested but the target kernel provides no UEFI loader");
    }

    if let Some(size) = &options.file_system_size {
        formatter.file_system_size(size);
    }
    formatter.boot(&options.boot_path);
    if options.uefi {
        let uefi_path = options.uefi_boot.as_ref().expect("checked above");
        let uefi_path = if options.arm {
            rewrite_uefi_path_for_arm(uefi_path)
        } else {
            uefi_path.clone()
        };
        formatter.uefi(&uefi_path);
    }
    formatter.file_system_path(&options.output_path);
    formatter.old_encoding(options.old_encoding);
    formatter
        .execute()
        .map_err(|e| BuildError::Formatter(e.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingFormatter {
        calls: RefCell<Vec<String>>,
    }

    impl MkfsCommand for RecordingFormatter {
        fn file_system_size(&mut self, size: &str) -> &mut dyn MkfsCommand {
            self.calls.borrow_mut().push(format!("size:{size}"));
            self
        }
        fn boot(&mut self, path: &Path) -> &mut dyn MkfsCommand {
            self.calls
                .borrow_mut()
                .push(format!("boot:{}", path.display()));
            self
        }
        fn uefi(&mut self, path: &Path) -> &mut dyn MkfsCommand {
            self.calls
                .borrow_mut()
                .push(format!("uefi:{}", path.display()));
            self
        }
        fn file_system_path(&mut self, path: &Path) -> &mut dyn MkfsCommand {
            self.calls
                .borrow_mut()
                .push(format!("fspath:{}", path.display()));
            self
        }
        fn old_encoding(&mut self, enabled: bool) -> &mut dyn MkfsCommand {
            self.calls.borrow_mut().push(format!("old_encoding:{enabled}"));
            self
        }
        fn execute(&mut self) -> Result<()> {
            self.calls.borrow_mut().push("execute".to_string());
            Ok(())
        }
    }

    #[test]
    fn uefi_on_arm_rewrites_path() {
        let manifest = Manifest::new();
        let options = WriteOptions {
            output_path: PathBuf::from("/out/image"),
            boot_path: PathBuf::from("/boot/boot.img"),
            uefi: true,
            uefi_boot: Some(PathBuf::from("/boot/bootx64.efi")),
            arm: true,
            ..Default::default()
        };
        let mut formatter = RecordingFormatter::default();
        write_image(&manifest, &options, &mut formatter).unwrap();
        let calls = formatter.calls.borrow();
        assert!(calls.contains(&"uefi:/boot-arm/bootaa64.efi".to_string()));
    }

    #[test]
    fn formatter_failure_wraps_as_build_error() {
        struct FailingFormatter;
        impl MkfsCommand for FailingFormatter {
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
                bail!("disk full")
            }
        }

        let manifest = Manifest::new();
        let options = WriteOptions::default();
        let mut formatter = FailingFormatter;
        let err = write_image(&manifest, &options, &mut formatter).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::Formatter(_))
        ));
    }

    #[test]
    fn uefi_without_loader_fails_before_any_call() {
        let manifest = Manifest::new();
        let options = WriteOptions {
            uefi: true,
            uefi_boot: None,
            ..Default::default()
        };
        let mut formatter = RecordingFormatter::default();
        assert!(write_image(&manifest, &options, &mut formatter).is_err());
        assert!(formatter.calls.borrow().is_empty());
    }
}
