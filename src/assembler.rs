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

//! Config→Manifest assembler (component D): translates a [`Config`] plus
//! an optional package path into a fully-populated [`Manifest`], in the
//! fourteen-phase order below. Each phase's inputs are immutable once the
//! prior phase has completed.

use crate::common_assets::ensure_common;
use crate::config::{Config, NicConfig, PassthroughValue};
use crate::error::BuildError;
use crate::manifest::{Manifest, NetworkConfig, SymlinkPolicy};
use crate::paths::OpsHome;
use crate::sharedlibs;
use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const RESOLV_CONF_GUEST: &str = "/etc/resolv.conf";
const HOSTNAME_GUEST: &str = "/proc/sys/kernel/hostname";
const PASSWD_GUEST: &str = "/etc/passwd";
const DEFAULT_HOSTNAME: &str = "uniboot";
const DEFAULT_PASSWD_LINE: &str = "root:x:0:0:root:/root:/bin/nobash";

/// Transient per-build state (spec §3.3). `working_dir` is recorded once,
/// up front, and threaded explicitly into path resolution rather than
/// relying on a process-wide chdir — see `DESIGN.md`'s Open Question
/// decisions.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub working_dir: PathBuf,
    pub temp_dir: tempfile_dir::TempDirHandle,
    pub target_arch: String,
    pub arm: bool,
}

/// Thin wrapper so `BuildContext` can be `Clone` and hold an owned path
/// to a directory this crate is responsible for removing on cleanup,
/// without pulling a `TempDir`'s RAII-on-drop semantics into a struct
/// that an orchestrator wants to clean up explicitly and observably.
pub mod tempfile_dir {
    use std::path::{Path, PathBuf};

    #[derive(Debug, Clone)]
    pub struct TempDirHandle(PathBuf);

    impl TempDirHandle {
        pub fn new(path: PathBuf) -> Self {
            TempDirHandle(path)
        }

        pub fn path(&self) -> &Path {
            &self.0
        }
    }
}

impl BuildContext {
    fn capture(config: &Config, working_dir: PathBuf) -> Result<Self> {
        let arm = config.kernel.contains("arm");
        let target_arch = if arm { "aarch64" } else { "x86_64" }.to_string();
        let build_dir_base = config
            .build_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        let temp_dir = build_dir_base.join(format!("uniboot-build-{}", std::process::id()));
        std::fs::create_dir_all(&temp_dir)
            .with_context(|| format!("creating build dir {}", temp_dir.display()))?;
        Ok(BuildContext {
            working_dir,
            temp_dir: tempfile_dir::TempDirHandle::new(temp_dir),
            target_arch,
            arm,
        })
    }
}

fn write_temp_file(ctx: &BuildContext, name: &str, contents: &str) -> Result<PathBuf> {
    let path = ctx.temp_dir.path().join(name);
    std::fs::write(&path, contents).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Resolves a `files`/`dirs` entry to a host path: absolute entries
/// against `target_root`, relative entries against
/// `local_files_parent_directory` (falling back to the captured working
/// directory).
fn resolve_host_path(config: &Config, ctx: &BuildContext, entry: &str) -> PathBuf {
    let path = Path::new(entry);
    if path.is_absolute() {
        if config.target_root.is_empty() {
            path.to_path_buf()
        } else {
            Path::new(&config.target_root).join(path.strip_prefix("/").unwrap_or(path))
        }
    } else {
        let base = config
            .local_files_parent_directory
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| ctx.working_dir.clone());
        base.join(path)
    }
}

fn glob_literal_prefix(pattern: &str) -> &str {
    let end = pattern
        .find(|c| matches!(c, '*' | '?' | '['))
        .unwrap_or(pattern.len());
    match pattern[..end].rfind('/') {
        Some(idx) => &pattern[..idx],
        None => "",
    }
}

/// Runs the full assembler. `package_path` selects the package-build
/// phase 3 when present, the host-build phase 4 otherwise.
pub fn assemble(
    config: &Config,
    package_path: Option<&Path>,
    home: &OpsHome,
) -> Result<(Manifest, BuildContext)> {
    // Phase 1: capture context.
    let working_dir = std::env::current_dir().context("reading current directory")?;
    let ctx = BuildContext::capture(config, working_dir)?;

    // Phase 2: base manifest.
    let mut manifest = Manifest::new();

    // Resolved program name, possibly overridden by phase 3/4.
    let mut program_host_path: Option<PathBuf> = None;

    if let Some(pkg) = package_path {
        // Phase 3: seed from package.
        let sysroot = pkg.join("sysroot");
        if sysroot.is_dir() {
            manifest.add_directory(&sysroot, "", "", SymlinkPolicy::Follow)?;
        } else {
            eprintln!("package {} has no sysroot; treating as empty", pkg.display());
        }
        let program_path = Path::new(&config.program);
        if program_path.is_relative() {
            let staged = pkg.join(program_path);
            let basename = program_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            manifest.add_file(&format!("/{}", basename), staged.clone())?;
            manifest.set_program(basename);
            program_host_path = Some(staged);
        } else {
            manifest.set_program(config.program.clone());
        }
    } else {
        // Phase 4: seed from host.
        ensure_common(home, ctx.arm, &mut manifest)?;
        let program_path = Path::new(&config.program);
        manifest.add_user_program(program_path, ctx.arm)?;
        program_host_path = Some(program_path.to_path_buf());
    }

    // Phase 5: core tree.
    if !config.kernel.is_empty() {
        manifest.add_kernel(&config.kernel);
    }
    let klib_dir = config.klib_dir.clone().unwrap_or_else(|| {
        home.version_dir(&config.nanos_version, config.nightly_build, ctx.arm)
            .to_string_lossy()
            .to_string()
    });
    manifest.set_klib_dir(klib_dir);

    let resolv_conf = format!(
        "{}\n",
        config
            .name_servers
            .iter()
            .map(|ns| format!("nameserver {}", ns))
            .collect::<Vec<_>>()
            .join("\n")
    );
    let resolv_path = write_temp_file(&ctx, "resolv.conf", &resolv_conf)?;
    manifest.add_file(RESOLV_CONF_GUEST, resolv_path)?;

    let hostname_path = write_temp_file(&ctx, "hostname", DEFAULT_HOSTNAME)?;
    manifest.add_file(HOSTNAME_GUEST, hostname_path)?;

    if !manifest.file_exists(PASSWD_GUEST) {
        let passwd_path = write_temp_file(&ctx, "passwd", DEFAULT_PASSWD_LINE)?;
        manifest.add_file(PASSWD_GUEST, passwd_path)?;
    }

    // Phase 6: klibs.
    manifest.add_klibs(config.klibs.iter().cloned());
    if config.env.contains_key("RADAR_KEY") {
        manifest.add_klibs(["tls", "radar"]);
    }
    if config.manifest_passthrough.contains_key("firewall") {
        manifest.add_klibs(["firewall"]);
    }

    // Phase 7: user files, map_dirs, dirs.
    for entry in &config.files {
        let host_path = resolve_host_path(config, &ctx, entry);
        let guest_path = if Path::new(entry).is_absolute() {
            entry.clone()
        } else {
            format!("/{}", entry)
        };
        manifest.add_file(&guest_path, host_path)?;
    }

    for (pattern, guest_dest) in &config.map_dirs {
        let base = glob_literal_prefix(pattern);
        for entry in glob::glob(pattern).with_context(|| format!("invalid glob {}", pattern))? {
            let host_path = entry.with_context(|| format!("reading glob match for {}", pattern))?;
            let rel = host_path
                .strip_prefix(base)
                .unwrap_or(&host_path)
                .to_string_lossy()
                .trim_start_matches('/')
                .to_string();
            let guest_path = format!("{}/{}", guest_dest.trim_end_matches('/'), rel);
            let basename = host_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if config.args.iter().any(|a| a == &basename) {
                bail!(BuildError::Config(format!(
                    "map_dirs entry {} collides with argument {}",
                    guest_path, basename
                )));
            }
            let metadata = std::fs::symlink_metadata(&host_path)
                .map_err(|e| BuildError::io(host_path.clone(), e))?;
            if metadata.is_dir() {
                manifest.mkdir_path(&guest_path)?;
            } else if metadata.file_type().is_symlink() {
                let target = std::fs::read_link(&host_path)?;
                manifest.add_link(&guest_path, target.to_string_lossy().to_string())?;
            } else {
                manifest.add_file(&guest_path, host_path)?;
            }
        }
    }

    for entry in &config.dirs {
        let host_path = resolve_host_path(config, &ctx, entry);
        let guest_dest = if Path::new(entry).is_absolute() {
            entry.clone()
        } else {
            format!("/{}", entry)
        };
        manifest.add_directory(&host_path, "", &guest_dest, SymlinkPolicy::Follow)?;
    }

    // Phase 8: arguments.
    for arg in &config.args {
        manifest.add_argument(arg.clone());
    }
    if let Some(arg1) = config.args.get(1) {
        if !config.disable_args_copy {
            let host_path = resolve_host_path(config, &ctx, arg1);
            if let Ok(metadata) = std::fs::symlink_metadata(&host_path) {
                let guest_path = if Path::new(arg1).is_absolute() {
                    arg1.clone()
                } else {
                    format!("/{}", arg1)
                };
                if metadata.is_dir() {
                    manifest.add_directory(&host_path, "", &guest_path, SymlinkPolicy::Follow)?;
                } else {
                    manifest.add_file(&guest_path, host_path)?;
                }
            }
            // stat failure merely skips the auto-stage, per §7.
        }
    }

    // Phase 9: env. Fixed pairs applied first, so user env may override
    // them — see DESIGN.md's Open Question decision.
    manifest.add_environment("USER", "root");
    manifest.add_environment("PWD", "/");
    manifest.add_environment("OPS_VERSION", env!("CARGO_PKG_VERSION"));
    manifest.add_environment("NANOS_VERSION", config.nanos_version.as_str());
    manifest.add_environment("NANOS_ARCH", ctx.target_arch.as_str());
    manifest.add_environment("IMAGE_NAME", config.run_config.image_name.as_str());
    for (k, v) in &config.env {
        manifest.add_environment(k.clone(), v.clone());
    }
    if config.env.contains_key("RADAR_KEY") && !config.env.contains_key("RADAR_IMAGE_NAME") {
        manifest.add_environment("RADAR_IMAGE_NAME", config.run_config.image_name.as_str());
    }

    // Phase 10: debug flags / notrace.
    if config.reboot_on_exit {
        manifest.add_debug_flag("reboot_on_exit", 't');
    }
    for flag in &config.debug_flags {
        manifest.add_debug_flag(flag.clone(), 't');
    }
    for syscall in &config.no_trace {
        manifest.add_no_trace(syscall.clone());
    }

    // Phase 11: mounts and network.
    for (guest, host) in &config.mounts {
        manifest.add_mount(guest.clone(), host.clone());
    }
    if !config.run_config.nics.is_empty() {
        let primary = &config.run_config.nics[0];
        manifest.add_network(NetworkConfig {
            ip_address: primary.ip_address.clone(),
            ipv6_address: String::new(),
            gateway: primary.gateway.clone(),
            net_mask: primary.net_mask.clone(),
        });
        for (i, nic) in config.run_config.nics.iter().enumerate().skip(1) {
            manifest.add_passthrough(format!("en{}", i), nic_passthrough(nic));
        }
    } else {
        manifest.add_network(NetworkConfig {
            ip_address: config.run_config.ip_address.clone(),
            ipv6_address: config.run_config.ipv6_address.clone(),
            gateway: config.run_config.gateway.clone(),
            net_mask: config.run_config.net_mask.clone(),
        });
    }

    // Phase 12: ports.
    if !config.run_config.ports.is_empty() {
        manifest.add_environment("OPS_PORT", config.run_config.ports.join(","));
    }

    // Phase 13: passthrough.
    for (k, v) in &config.manifest_passthrough {
        manifest.add_passthrough(k.clone(), v.clone());
    }

    // Phase 14: shared libraries (non-package builds only).
    if package_path.is_none() {
        if let Some(program) = &program_host_path {
            let target_root = if config.target_root.is_empty() {
                None
            } else {
                Some(Path::new(&config.target_root))
            };
            match sharedlibs::resolve(target_root, program) {
                Ok(libs) => {
                    for (guest, host) in libs {
                        manifest.add_file(&guest, host)?;
                    }
                }
                Err(e) => bail!(BuildError::Resolver(e.to_string())),
            }
        }
    }

    Ok((manifest, ctx))
}

fn nic_passthrough(nic: &NicConfig) -> PassthroughValue {
    let mut map = BTreeMap::new();
    map.insert(
        "ipaddr".to_string(),
        PassthroughValue::Scalar(nic.ip_address.clone()),
    );
    map.insert(
        "netmask".to_string(),
        PassthroughValue::Scalar(nic.net_mask.clone()),
    );
    map.insert(
        "gateway".to_string(),
        PassthroughValue::Scalar(nic.gateway.clone()),
    );
    PassthroughValue::Map(map)
}
