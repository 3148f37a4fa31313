//! Manual module mapping.
//!
//! Maps module images into a [`crate::process::ProcessSpace`] the way a native
//! loader would, without going through any registration machinery the target
//! exposes: memory is allocated and populated by hand, relocations and import
//! slots are rewritten in place, TLS and exception state is wired up, and the
//! module's own initialization code runs last.
//!
//! # Architecture
//!
//! [`ModuleMapper`] is the entry point; one mapper maps one root image and is
//! consumed by [`ModuleMapper::map_and_initialize`]. Dependencies declared in
//! the image's import table are resolved from the process's image store and
//! mapped recursively through the same pipeline. A failure anywhere rolls back
//! everything the attempt committed, including freshly mapped dependencies,
//! so mapping is all-or-nothing.
//!
//! # Key Components
//!
//! - [`ModuleMapper`] - configures and runs one mapping
//! - [`MappedModule`] - handle to a successfully mapped module
//! - [`MappingConfig`], [`MappingFlags`], [`SxsPolicy`] - mapping behaviour
//! - [`activation::ActivationContext`] - manifest-driven dependency redirects
//!
//! # Examples
//!
//! ```rust,no_run
//! use lodestone::{mapper::ModuleMapper, process::ProcessSpace};
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

pub mod activation;
mod entry;
mod exceptions;
mod imports;
mod loader;
mod relocate;
mod tls;

use std::{path::Path, sync::Arc};

use bitflags::bitflags;

use crate::{
    process::{ModuleRecord, ProcessSpace},
    Result,
};

bitflags! {
    /// Optional behaviours of a mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MappingFlags: u32 {
        /// Do not copy the image headers and leave the header page inaccessible.
        const DISCARD_HEADERS = 1 << 0;
        /// Map without delivering any lifecycle notifications to the module.
        const SKIP_INIT_ROUTINES = 1 << 1;
    }
}

/// How manifest-declared dependency redirects are honoured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SxsPolicy {
    /// Follow side-by-side redirects; a declared redirect is authoritative.
    #[default]
    SideBySide,
    /// Ignore manifests and resolve every dependency by its plain name.
    Private,
}

/// Configuration applied to a mapping and inherited by its dependencies.
#[derive(Debug, Clone, Default)]
pub struct MappingConfig {
    /// Optional mapping behaviours
    pub flags: MappingFlags,
    /// Dependency redirect policy
    pub policy: SxsPolicy,
}

/// Maps one module image into a process.
pub struct ModuleMapper {
    space: Arc<ProcessSpace>,
    name: String,
    origin: String,
    bytes: Vec<u8>,
    config: MappingConfig,
}

impl ModuleMapper {
    /// Create a mapper for in-memory image bytes, identified by `origin`.
    #[must_use]
    pub fn new_from_mem(space: &Arc<ProcessSpace>, origin: &str, bytes: Vec<u8>) -> Self {
        ModuleMapper {
            space: space.clone(),
            name: short_name(origin),
            origin: origin.to_string(),
            bytes,
            config: MappingConfig::default(),
        }
    }

    /// Create a mapper for an image file on disk.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file cannot be read.
    pub fn new_from_file(space: &Arc<ProcessSpace>, path: &Path) -> Result<Self> {
        let origin = path.display().to_string();
        let bytes = std::fs::read(path)?;
        Ok(Self::new_from_mem(space, &origin, bytes))
    }

    /// Replace the default configuration.
    #[must_use]
    pub fn with_config(mut self, config: MappingConfig) -> Self {
        self.config = config;
        self
    }

    /// Run the full mapping pipeline and the module's initialization.
    ///
    /// Mapping an origin that is already resident returns a handle to the
    /// existing module instead of mapping a second copy.
    ///
    /// # Errors
    /// Any stage failure aborts and rolls back the whole attempt; the process
    /// is left as it was before the call.
    pub fn map_and_initialize(self) -> Result<MappedModule> {
        let record = loader::map_image(
            &self.space,
            &self.name,
            &self.origin,
            self.bytes,
            &self.config,
            0,
            false,
        )?;

        Ok(MappedModule {
            space: self.space,
            record,
        })
    }
}

/// Handle to a mapped module.
///
/// Cloning the handle does not add a reference; references are counted per
/// successful mapping call.
#[derive(Clone)]
pub struct MappedModule {
    space: Arc<ProcessSpace>,
    record: Arc<ModuleRecord>,
}

impl MappedModule {
    /// The module's registry record.
    #[must_use]
    pub fn record(&self) -> &Arc<ModuleRecord> {
        &self.record
    }

    /// Base address of the mapped image.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.record.base()
    }

    /// The process the module is mapped into.
    #[must_use]
    pub fn space(&self) -> &Arc<ProcessSpace> {
        &self.space
    }

    /// Release this mapping.
    ///
    /// The module is torn down when the last reference goes; unmapping an
    /// already torn down module is a no-op. Teardown itself is best-effort:
    /// every step runs and the first error is reported.
    ///
    /// # Errors
    /// Returns the first teardown error, if any step failed.
    pub fn unmap(&self) -> Result<()> {
        loader::unmap_module(&self.space, &self.record)
    }
}

fn short_name(origin: &str) -> String {
    origin
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(origin)
        .to_string()
}
