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

//! Manifest assembly and staging core for unikernel disk images.
//!
//! This crate takes a user program together with a declarative
//! [`config::Config`], and assembles an in-memory [`manifest::Manifest`]
//! describing the target filesystem, kernel parameters, and runtime
//! configuration. The [`orchestrator`] module is the only entry point;
//! everything else here is the machinery it drives. The crate does not
//! parse a command line, talk to any cloud provider, or write the final
//! disk image itself — the image writer façade in [`writer`] hands the
//! manifest to an externally supplied filesystem formatter.

#[macro_use]
extern crate anyhow;

pub mod archive;
pub mod assembler;
pub mod common_assets;
pub mod config;
pub mod download;
pub mod error;
pub mod manifest;
pub mod orchestrator;
pub mod paths;
pub mod sharedlibs;
pub mod util;
pub mod writer;

pub use config::Config;
pub use error::BuildError;
pub use manifest::Manifest;
pub use orchestrator::{build_image, build_image_from_package};
pub use paths::OpsHome;
