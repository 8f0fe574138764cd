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

//! Shared-library resolver (component C): given an executable and a
//! target root, produces a mapping of guest library paths to host file
//! paths by walking the ELF dynamic section's `DT_NEEDED` entries to
//! their transitive closure.

use anyhow::{Context, Result};
use goblin::elf::Elf;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Host directories searched for a `DT_NEEDED` name, in order, before
/// giving up. `target_root` (if any) is searched first so that a package
/// sysroot's own copy of a library wins over the host's.
fn search_dirs(target_root: Option<&Path>) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(root) = target_root {
        dirs.push(root.join("lib"));
        dirs.push(root.join("lib64"));
        dirs.push(root.join("usr/lib"));
    }
    dirs.push(PathBuf::from("/lib"));
    dirs.push(PathBuf::from("/lib64"));
    dirs.push(PathBuf::from("/usr/lib"));
    dirs.push(PathBuf::from("/usr/lib/x86_64-linux-gnu"));
    dirs
}

fn find_library(name: &str, target_root: Option<&Path>) -> Result<PathBuf> {
    for dir in search_dirs(target_root) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    anyhow::bail!("unresolved shared library: {}", name)
}

fn needed_of(path: &Path) -> Result<Vec<String>> {
    let data =
        std::fs::read(path).with_context(|| format!("reading executable {}", path.display()))?;
    let elf = Elf::parse(&data).with_context(|| format!("parsing ELF {}", path.display()))?;
    Ok(elf.libraries.iter().map(|s| s.to_string()).collect())
}

/// Resolves `program`'s transitive `DT_NEEDED` closure, rooted under
/// `target_root` when present, returning guest path (`/lib/<name>`) to
/// host path pairs.
pub fn resolve(target_root: Option<&Path>, program: &Path) -> Result<BTreeMap<String, PathBuf>> {
    let mut resolved = BTreeMap::new();
    let mut queue = needed_of(program)?;
    let mut seen = std::collections::BTreeSet::new();

    while let Some(name) = queue.pop() {
        if !seen.insert(name.clone()) {
            continue;
        }
        let host_path = find_library(&name, target_root)?;
        resolved.insert(format!("/lib/{}", name), host_path.clone());
        for dep in needed_of(&host_path)? {
            if !seen.contains(&dep) {
                queue.push(dep);
            }
        }
    }
    Ok(resolved)
}

/// Writes a minimal, statically-linked (no `DT_NEEDED` entries) ELF64
/// executable, valid enough for `goblin::elf::Elf::parse`. Used by other
/// modules' tests that need a program file the resolver can walk without
/// requiring a real toolchain-built binary.
#[cfg(test)]
pub(crate) fn write_minimal_elf(path: &Path) -> std::io::Result<()> {
    let mut header = [0u8; 64];
    header[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    header[4] = 2; // ELFCLASS64
    header[5] = 1; // ELFDATA2LSB
    header[6] = 1; // EV_CURRENT
    header[16..18].copy_from_slice(&2u16.to_le_bytes()); // e_type = ET_EXEC
    header[18..20].copy_from_slice(&62u16.to_le_bytes()); // e_machine = EM_X86_64
    header[20..24].copy_from_slice(&1u32.to_le_bytes()); // e_version
    header[52..54].copy_from_slice(&64u16.to_le_bytes()); // e_ehsize
    header[54..56].copy_from_slice(&56u16.to_le_bytes()); // e_phentsize
    header[58..60].copy_from_slice(&64u16.to_le_bytes()); // e_shentsize
    std::fs::write(path, header)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_empty_closure_for_statically_linked_program() {
        let tmp = tempfile::tempdir().unwrap();
        let program = tmp.path().join("prog");
        write_minimal_elf(&program).unwrap();
        let resolved = resolve(None, &program).unwrap();
        assert!(resolved.is_empty());
    }

    #[test]
    fn missing_library_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("does-not-exist");
        assert!(find_library("libfoo.so", Some(&missing)).is_err());
    }

    #[test]
    fn search_dirs_prefers_target_root() {
        let dirs = search_dirs(Some(Path::new("/pkg")));
        assert_eq!(dirs[0], PathBuf::from("/pkg/lib"));
    }
}
