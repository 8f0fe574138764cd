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

//! Archive creator (§6.4): packages a set of host files into a
//! gzip-compressed POSIX tar, ancillary to packaging rather than part of
//! the image-assembly hot path.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Creates `archive_path` from `files`, a map of guest rename to host
/// path. Entries are written in the map's iteration order; an empty
/// rename falls back to the host path's basename.
pub fn create_archive(archive_path: impl AsRef<Path>, files: &BTreeMap<String, PathBuf>) -> Result<()> {
    let archive_path = archive_path.as_ref();
    let out = File::create(archive_path)
        .with_context(|| format!("creating {}", archive_path.display()))?;
    let encoder = flate2::write::GzEncoder::new(out, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for (rename, host_path) in files {
        let name = if rename.is_empty() {
            host_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default()
        } else {
            rename.clone()
        };
        let mut file = File::open(host_path)
            .with_context(|| format!("opening {}", host_path.display()))?;
        builder
            .append_file(&name, &mut file)
            .with_context(|| format!("adding {} to archive", name))?;
    }

    builder.into_inner().and_then(|enc| enc.finish())?;
    Ok(())
}

/// Extracts a gzip-compressed tar archive at `archive_path` into `dest_dir`.
pub fn extract_archive(archive_path: impl AsRef<Path>, dest_dir: impl AsRef<Path>) -> Result<()> {
    let archive_path = archive_path.as_ref();
    let dest_dir = dest_dir.as_ref();
    std::fs::create_dir_all(dest_dir)
        .with_context(|| format!("creating {}", dest_dir.display()))?;
    let file = File::open(archive_path)
        .with_context(|| format!("opening {}", archive_path.display()))?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    archive
        .unpack(dest_dir)
        .with_context(|| format!("extracting {} into {}", archive_path.display(), dest_dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    #[test]
    fn roundtrip_archive() {
        let src = tempfile::tempdir().unwrap();
        let file_path = src.path().join("payload.txt");
        std::fs::write(&file_path, b"hello unikernel").unwrap();

        let archive_dir = tempfile::tempdir().unwrap();
        let archive_path = archive_dir.path().join("out.tar.gz");
        let files = btreemap! { "renamed.txt".to_string() => file_path.clone() };
        create_archive(&archive_path, &files).unwrap();
        assert!(archive_path.exists());

        let extract_dir = tempfile::tempdir().unwrap();
        extract_archive(&archive_path, extract_dir.path()).unwrap();
        let extracted = std::fs::read(extract_dir.path().join("renamed.txt")).unwrap();
        assert_eq!(extracted, b"hello unikernel");
    }

    #[test]
    fn empty_rename_uses_basename() {
        let src = tempfile::tempdir().unwrap();
        let file_path = src.path().join("keep-name.bin");
        std::fs::write(&file_path, b"x").unwrap();

        let archive_dir = tempfile::tempdir().unwrap();
        let archive_path = archive_dir.path().join("out.tar.gz");
        let files = btreemap! { String::new() => file_path.clone() };
        create_archive(&archive_path, &files).unwrap();

        let extract_dir = tempfile::tempdir().unwrap();
        extract_archive(&archive_path, extract_dir.path()).unwrap();
        assert!(extract_dir.path().join("keep-name.bin").exists());
    }
}
