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

//! The manifest tree (component B): an in-memory, hierarchical
//! representation of the target filesystem plus kernel parameters,
//! program arguments, environment, mounts, klibs, network configuration,
//! and arbitrary passthrough trees.
//!
//! Guest paths are resolved segment-by-segment against a tree of tagged
//! nodes; pre-joined path strings are never used as map keys, so that a
//! directory and one of its descendants can't collide on string
//! formatting alone.

use crate::config::PassthroughValue;
use crate::error::BuildError;
use anyhow::{anyhow, bail, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// A node in the guest filesystem tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Dir(BTreeMap<String, Node>),
    File(PathBuf),
    Link(String),
}

impl Node {
    fn empty_dir() -> Self {
        Node::Dir(BTreeMap::new())
    }
}

/// Primary network interface configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkConfig {
    pub ip_address: String,
    pub ipv6_address: String,
    pub gateway: String,
    pub net_mask: String,
}

/// The manifest tree plus the attribute singletons listed in spec §3.2.
#[derive(Debug, Clone)]
pub struct Manifest {
    root: Node,
    program: Option<String>,
    kernel: Option<PathBuf>,
    klib_dir: Option<PathBuf>,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    klibs: Vec<String>,
    mounts: BTreeMap<String, String>,
    network: Option<NetworkConfig>,
    debug_flags: BTreeMap<String, char>,
    no_trace: BTreeSet<String>,
    passthrough: BTreeMap<String, PassthroughValue>,
}

/// Symlink handling for [`Manifest::add_directory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymlinkPolicy {
    /// Preserve symlinks as link leaves (used by `map_dirs` staging).
    Preserve,
    /// Follow symlinks and stage their targets (used by sysroot staging).
    Follow,
}

fn segments(guest: &str) -> Vec<&str> {
    guest.split('/').filter(|s| !s.is_empty()).collect()
}

impl Default for Manifest {
    fn default() -> Self {
        Manifest {
            root: Node::empty_dir(),
            program: None,
            kernel: None,
            klib_dir: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            klibs: Vec::new(),
            mounts: BTreeMap::new(),
            network: None,
            debug_flags: BTreeMap::new(),
            no_trace: BTreeSet::new(),
            passthrough: BTreeMap::new(),
        }
    }
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages a single file at `guest`, reading its contents lazily from
    /// `host` at image-write time. A second identical staging is a no-op;
    /// a conflicting one fails.
    pub fn add_file(&mut self, guest: &str, host: impl Into<PathBuf>) -> Result<()> {
        let host = host.into();
        let segs = segments(guest);
        if segs.is_empty() {
            bail!(BuildError::InvariantViolation(
                "cannot stage a file at the manifest root".to_string()
            ));
        }
        Self::insert_leaf(&mut self.root, &segs, Node::File(host))
    }

    /// Creates a symlink leaf at `guest` pointing at `target`.
    pub fn add_link(&mut self, guest: &str, target: impl Into<String>) -> Result<()> {
        let segs = segments(guest);
        if segs.is_empty() {
            bail!(BuildError::InvariantViolation(
                "cannot stage a link at the manifest root".to_string()
            ));
        }
        Self::insert_leaf(&mut self.root, &segs, Node::Link(target.into()))
    }

    /// Ensures an (empty, if newly created) directory exists at `guest`.
    pub fn mkdir_path(&mut self, guest: &str) -> Result<()> {
        let segs = segments(guest);
        Self::mkdir(&mut self.root, &segs)
    }

    /// Predicate: does a leaf or directory already exist at `guest`?
    pub fn file_exists(&self, guest: &str) -> bool {
        let segs = segments(guest);
        Self::lookup(&self.root, &segs).is_some()
    }

    /// Recursively stages `host_src`'s contents under `base`/`guest_dst`.
    pub fn add_directory(
        &mut self,
        host_src: impl AsRef<Path>,
        guest_dst: &str,
        base: &str,
        policy: SymlinkPolicy,
    ) -> Result<()> {
        let host_src = host_src.as_ref();
        let follow = policy == SymlinkPolicy::Follow;
        for entry in WalkDir::new(host_src).follow_links(follow) {
            let entry = entry?;
            let rel = entry
                .path()
                .strip_prefix(host_src)
                .map_err(|e| anyhow!("computing relative path: {}", e))?;
            let guest_path = join_guest(base, guest_dst, rel);
            let file_type = entry.file_type();
            if file_type.is_dir() {
                if !guest_path.is_empty() {
                    self.mkdir_path(&guest_path)?;
                }
            } else if file_type.is_symlink() {
                let target = std::fs::read_link(entry.path())?;
                self.add_link(&guest_path, target.to_string_lossy().to_string())?;
            } else {
                self.add_file(&guest_path, entry.path().to_path_buf())?;
            }
        }
        Ok(())
    }

    pub fn set_program(&mut self, program: impl Into<String>) {
        self.program = Some(program.into());
    }

    pub fn program(&self) -> Option<&str> {
        self.program.as_deref()
    }

    pub fn add_kernel(&mut self, kernel: impl Into<PathBuf>) {
        self.kernel = Some(kernel.into());
    }

    pub fn kernel(&self) -> Option<&Path> {
        self.kernel.as_deref()
    }

    pub fn set_klib_dir(&mut self, dir: impl Into<PathBuf>) {
        self.klib_dir = Some(dir.into());
    }

    pub fn klib_dir(&self) -> Option<&Path> {
        self.klib_dir.as_deref()
    }

    /// Appends `names`, de-duplicating against prior entries while
    /// preserving first-insertion order.
    pub fn add_klibs<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            let name = name.into();
            if !self.klibs.contains(&name) {
                self.klibs.push(name);
            }
        }
    }

    pub fn klibs(&self) -> &[String] {
        &self.klibs
    }

    pub fn add_argument(&mut self, arg: impl Into<String>) {
        self.args.push(arg.into());
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn add_environment(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn add_debug_flag(&mut self, name: impl Into<String>, mode: char) {
        self.debug_flags.insert(name.into(), mode);
    }

    pub fn debug_flags(&self) -> &BTreeMap<String, char> {
        &self.debug_flags
    }

    pub fn add_no_trace(&mut self, name: impl Into<String>) {
        self.no_trace.insert(name.into());
    }

    pub fn no_trace(&self) -> &BTreeSet<String> {
        &self.no_trace
    }

    pub fn add_mount(&mut self, guest: impl Into<String>, host: impl Into<String>) {
        self.mounts.insert(guest.into(), host.into());
    }

    pub fn mounts(&self) -> &BTreeMap<String, String> {
        &self.mounts
    }

    pub fn add_network(&mut self, config: NetworkConfig) {
        self.network = Some(config);
    }

    pub fn network(&self) -> Option<&NetworkConfig> {
        self.network.as_ref()
    }

    pub fn add_passthrough(&mut self, key: impl Into<String>, tree: PassthroughValue) {
        self.passthrough.insert(key.into(), tree);
    }

    pub fn passthrough(&self) -> &BTreeMap<String, PassthroughValue> {
        &self.passthrough
    }

    /// Resolves the user program and stages it at `/<basename>`, setting
    /// the `program` singleton to that basename. `arm` is accepted for
    /// interface symmetry with the shared-library resolution that follows
    /// in the assembler; this step itself doesn't need it.
    pub fn add_user_program(&mut self, program: impl AsRef<Path>, _arm: bool) -> Result<()> {
        let program = program.as_ref();
        let basename = program
            .file_name()
            .ok_or_else(|| anyhow!("program path {} has no file name", program.display()))?
            .to_string_lossy()
            .to_string();
        self.add_file(&format!("/{}", basename), program.to_path_buf())?;
        self.set_program(basename);
        Ok(())
    }

    fn insert_leaf(node: &mut Node, segs: &[&str], leaf: Node) -> Result<()> {
        let (head, rest) = (segs[0], &segs[1..]);
        let children = match node {
            Node::Dir(children) => children,
            _ => bail!(BuildError::InvariantViolation(
                "path component is not a directory".to_string()
            )),
        };
        if rest.is_empty() {
            match children.get(head) {
                None => {
                    children.insert(head.to_string(), leaf);
                }
                Some(existing) if *existing == leaf => {
                    // identical restage: no-op
                }
                Some(Node::Dir(_)) => {
                    bail!(BuildError::InvariantViolation(format!(
                        "guest path {} is already a directory",
                        head
                    )));
                }
                Some(_) => {
                    bail!(BuildError::InvariantViolation(format!(
                        "guest path {} already staged from a different source",
                        head
                    )));
                }
            }
            Ok(())
        } else {
            let entry = children
                .entry(head.to_string())
                .or_insert_with(Node::empty_dir);
            if !matches!(entry, Node::Dir(_)) {
                bail!(BuildError::InvariantViolation(format!(
                    "guest path {} is already a file or link",
                    head
                )));
            }
            Self::insert_leaf(entry, rest, leaf)
        }
    }

    fn mkdir(node: &mut Node, segs: &[&str]) -> Result<()> {
        if segs.is_empty() {
            return Ok(());
        }
        let (head, rest) = (segs[0], &segs[1..]);
        let children = match node {
            Node::Dir(children) => children,
            _ => bail!(BuildError::InvariantViolation(
                "path component is not a directory".to_string()
            )),
        };
        let entry = children
            .entry(head.to_string())
            .or_insert_with(Node::empty_dir);
        if !matches!(entry, Node::Dir(_)) {
            bail!(BuildError::InvariantViolation(format!(
                "guest path {} already staged as a non-directory",
                head
            )));
        }
        Self::mkdir(entry, rest)
    }

    fn lookup<'a>(node: &'a Node, segs: &[&str]) -> Option<&'a Node> {
        if segs.is_empty() {
            return Some(node);
        }
        match node {
            Node::Dir(children) => children.get(segs[0]).and_then(|n| Self::lookup(n, &segs[1..])),
            _ => None,
        }
    }
}

fn join_guest(base: &str, guest_dst: &str, rel: &Path) -> String {
    let mut out = String::new();
    for part in [base, guest_dst] {
        let trimmed = part.trim_matches('/');
        if !trimmed.is_empty() {
            out.push('/');
            out.push_str(trimmed);
        }
    }
    for component in rel.components() {
        let part = component.as_os_str().to_string_lossy();
        if !part.is_empty() && part != "." {
            out.push('/');
            out.push_str(&part);
        }
    }
    out
}
