// Copyright 2019 CoreOS, Inc.
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

//! HTTP downloader (§6.3): fetches a URL to a temp file in the
//! destination directory and renames it onto `dest_path` atomically on
//! success, removing it on any failure. Used by the common-asset
//! provisioner, and available to release fetchers outside this crate.

use crate::error::BuildError;
use anyhow::{bail, Context, Result};
use byte_unit::Byte;
use nix::unistd::isatty;
use std::fs::{remove_file, File};
use std::io::{self, copy, stderr, BufWriter, Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const BUFFER_SIZE: usize = 128 * 1024;

/// Downloads `url` to `dest_path`, reporting progress to stderr if
/// `show_progress` is set and attaching `api_key` as a bearer credential
/// if present. Creates the final file only on a clean HTTP 200 response;
/// any other outcome leaves `dest_path` untouched.
pub fn download(
    url: &str,
    dest_path: &Path,
    timeout_seconds: u64,
    show_progress: bool,
    api_key: Option<&str>,
) -> Result<()> {
    let dest_dir = dest_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dest_dir)
        .with_context(|| format!("creating {}", dest_dir.display()))?;

    let tempfile = tempfile::NamedTempFile::new_in(dest_dir)
        .with_context(|| format!("creating temp file in {}", dest_dir.display()))?;

    match download_into(url, tempfile.path(), timeout_seconds, show_progress, api_key) {
        Ok(()) => {
            tempfile
                .persist(dest_path)
                .with_context(|| format!("renaming download onto {}", dest_path.display()))?;
            Ok(())
        }
        Err(e) => {
            // NamedTempFile removes itself on drop; be explicit anyway in
            // case persist() left a renamed copy behind on some platforms.
            let _ = remove_file(tempfile.path());
            Err(e)
        }
    }
}

fn download_into(
    url: &str,
    tmp_path: &Path,
    timeout_seconds: u64,
    show_progress: bool,
    api_key: Option<&str>,
) -> Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(timeout_seconds))
        .build()
        .context("building HTTP client")?;

    let mut request = client.get(url);
    if let Some(key) = api_key {
        request = request.header("Authorization", format!("Bearer {}", key));
    }

    let response = request
        .send()
        .with_context(|| format!("requesting {}", url))?;
    if response.status().as_u16() != 200 {
        bail!(BuildError::Network(format!(
            "cannot download file: {} returned {}",
            url,
            response.status()
        )));
    }

    let length = response.content_length();
    let mut source: Box<dyn Read> = if show_progress {
        Box::new(ProgressReader::new(response, length))
    } else {
        Box::new(response)
    };

    let file = File::create(tmp_path)
        .with_context(|| format!("creating {}", tmp_path.display()))?;
    let mut writer = BufWriter::with_capacity(BUFFER_SIZE, file);
    copy(&mut source, &mut writer).with_context(|| format!("downloading {}", url))?;
    writer
        .flush()
        .with_context(|| format!("writing {}", tmp_path.display()))?;
    Ok(())
}

/// Plain download into a caller-chosen path, skipping progress reporting.
/// Convenient for tests and non-interactive callers.
pub fn download_to_path(url: &str, dest_path: &Path, timeout_seconds: u64) -> Result<PathBuf> {
    download(url, dest_path, timeout_seconds, false, None)?;
    Ok(dest_path.to_path_buf())
}

struct ProgressReader<R: Read> {
    source: R,
    length: Option<u64>,
    position: u64,
    last_report: Instant,
    tty: bool,
    prologue: &'static str,
    epilogue: &'static str,
}

impl<R: Read> ProgressReader<R> {
    fn new(source: R, length: Option<u64>) -> Self {
        let tty = isatty(stderr().as_raw_fd()).unwrap_or_else(|e| {
            eprintln!("checking if stderr is a TTY: {e}");
            false
        });
        ProgressReader {
            source,
            length,
            position: 0,
            last_report: Instant::now(),
            tty,
            prologue: if tty { "> " } else { "" },
            epilogue: if tty { "   \r" } else { "\n" },
        }
    }

    fn format_bytes(count: u64) -> String {
        let adjusted = Byte::from_u64(count).get_appropriate_unit(byte_unit::UnitType::Binary);
        format!("{adjusted:.1}")
    }
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.source.read(buf)?;
        self.position += count as u64;
        if self.last_report.elapsed() >= Duration::from_secs(1) || count == 0 {
            self.last_report = Instant::now();
            match self.length {
                Some(length) if length > 0 => eprint!(
                    "{}Downloaded {}/{} ({}%){}",
                    self.prologue,
                    Self::format_bytes(self.position),
                    Self::format_bytes(length),
                    100 * self.position / length,
                    self.epilogue
                ),
                _ => eprint!(
                    "{}Downloaded {}{}",
                    self.prologue,
                    Self::format_bytes(self.position),
                    self.epilogue
                ),
            }
            let _ = io::stdout().flush();
        }
        Ok(count)
    }
}

impl<R: Read> Drop for ProgressReader<R> {
    fn drop(&mut self) {
        if self.tty {
            eprintln!();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_download_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("asset.tar.gz");
        let result = download("http://127.0.0.1:1/does-not-exist", &dest, 1, false, None);
        assert!(result.is_err());
        assert!(!dest.exists());
    }

    #[test]
    fn non_200_response_errors_as_network_build_error() {
        use std::io::{Read as _, Write as _};
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            stream
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("asset.tar.gz");
        let url = format!("http://{}/missing", addr);
        let err = download(&url, &dest, 5, false, None).unwrap_err();
        server.join().unwrap();

        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::Network(_))
        ));
        assert!(!dest.exists());
    }
}
