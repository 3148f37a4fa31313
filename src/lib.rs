// Copyright 2026 Johann Kempter
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
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(dead_code)]
#![allow(clippy::too_many_arguments)]
//#![deny(unsafe_code)]
// - 'image/physical.rs' uses mmap to map a file into memory

//! # lodestone
//!
//! A manual module mapping engine built in pure Rust. `lodestone` loads module
//! images into a modeled process the way a native loader would, without any of
//! the target's own registration machinery: it allocates and populates the
//! image memory by hand, applies relocations, resolves and patches imports,
//! wires up thread-local storage and exception dispatch, and finally runs the
//! module's own initialization code.
//!
//! ## Features
//!
//! - **Complete mapping pipeline** - headers, sections, relocations, imports,
//!   TLS, exception tables and entry point invocation in loader order
//! - **Recursive dependency resolution** - imports pull dependencies out of an
//!   image store and map them through the same pipeline, shared by refcount
//! - **Manifest-driven redirects** - side-by-side activation contexts resolve
//!   versioned dependency identities deterministically
//! - **All-or-nothing semantics** - any stage failure rolls back every effect
//!   the attempt committed, including freshly mapped dependencies
//! - **Contained module code** - a panic escaping a callback or entry routine
//!   is reported as an error, never a crash of the host
//! - **Memory safe** - built in Rust with comprehensive error handling
//!
//! ## Quick Start
//!
//! Add `lodestone` to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! lodestone = "0.1"
//! ```
//!
//! ### Using the Prelude
//!
//! For convenient access to the most commonly used types, import the prelude:
//!
//! ```rust,no_run
//! use lodestone::prelude::*;
//! use std::path::Path;
//!
//! # fn main() -> lodestone::Result<()> {
//! let space = ProcessSpace::new();
//! let mapped = ModuleMapper::new_from_file(&space, Path::new("probe.lmd"))?
//!     .map_and_initialize()?;
//! println!("mapped at {:#x}", mapped.base());
//! mapped.unmap()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! The crate is split along the boundary a real loader sits on:
//!
//! - [`image`] - the module image format: parsing, validation and the typed
//!   views of every directory, plus a builder for assembling well-formed images
//! - [`process`] - the modeled target: page-protected virtual memory, routine
//!   dispatch, TLS slots, exception registrations and the module registry
//! - [`mapper`] - the pipeline that bridges the two, stage by stage
//!
//! ## Error Handling
//!
//! All operations return [`Result<T, Error>`](Result) with comprehensive error
//! information:
//!
//! ```rust,no_run
//! use lodestone::{Error, image::ModuleImage};
//!
//! match ModuleImage::from_file(std::path::Path::new("probe.lmd")) {
//!     Ok(image) => println!("parsed {} sections", image.sections().len()),
//!     Err(Error::NotSupported) => println!("image flavour not supported"),
//!     Err(Error::Malformed { message, .. }) => println!("malformed image: {}", message),
//!     Err(e) => println!("other error: {}", e),
//! }
//! ```
//!
//! ## Testing
//!
//! The test suite builds its probe images with [`image::builder::ImageBuilder`]
//! and exercises the full pipeline against the modeled process:
//!
//! ```bash
//! cargo test
//! ```
#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

/// Convenient re-exports of the most commonly used types and traits.
///
/// This module provides a curated selection of the most frequently used types
/// from across the lodestone library, allowing for convenient glob imports.
///
/// # Example
///
/// ```rust,no_run
/// use lodestone::prelude::*;
///
/// let space = ProcessSpace::new();
/// assert_eq!(space.module_count(), 0);
/// ```
pub mod prelude;

/// The module image format: parsing, validation and directory access.
///
/// Everything that can be known about an image before it is mapped lives here:
/// the header and section table, the relocation, import, export, TLS,
/// exception and manifest directories, and the backends the raw bytes are read
/// through.
///
/// # Key Types
///
/// - [`image::ModuleImage`] - a parsed, validated image
/// - [`image::builder::ImageBuilder`] - assembles well-formed images
/// - [`image::parser::Parser`] - bounds-checked little-endian cursor
///
/// # Examples
///
/// ```rust,no_run
/// use lodestone::image::ModuleImage;
///
/// let image = ModuleImage::from_file(std::path::Path::new("probe.lmd"))?;
/// println!("prefers {:#x}", image.preferred_base());
/// # Ok::<(), lodestone::Error>(())
/// ```
pub mod image;

/// The mapping pipeline and its configuration.
///
/// # Key Types
///
/// - [`mapper::ModuleMapper`] - configures and runs one mapping
/// - [`mapper::MappedModule`] - handle to a successfully mapped module
/// - [`mapper::MappingConfig`] - flags and the side-by-side policy
///
/// # Examples
///
/// ```rust,no_run
/// use lodestone::{mapper::ModuleMapper, process::ProcessSpace};
///
/// # fn main() -> lodestone::Result<()> {
/// let space = ProcessSpace::new();
/// let mapped = ModuleMapper::new_from_mem(&space, "probe.lmd", vec![])
///     .map_and_initialize()?;
/// # Ok(())
/// # }
/// ```
pub mod mapper;

/// The modeled target process.
///
/// # Key Types
///
/// - [`process::ProcessSpace`] - memory, routines, TLS, exceptions, registry
/// - [`process::ModuleRecord`] - one mapped module as the process sees it
/// - [`process::routines::NotificationReason`] - lifecycle notification kinds
pub mod process;

/// The result type used throughout the crate. Contains the custom `Error` type,
/// with proper error handling.
pub type Result<T> = std::result::Result<T, Error>;

/// The unified error type for everything that can go wrong while parsing an
/// image, mapping a module, or running its code.
pub use error::Error;

/// Low-level little-endian parsing utilities.
///
/// # Example
///
/// ```rust
/// use lodestone::Parser;
///
/// let mut parser = Parser::new(&[0x34, 0x12]);
/// assert_eq!(parser.read_u16()?, 0x1234);
/// # Ok::<(), lodestone::Error>(())
/// ```
pub use image::parser::Parser;
