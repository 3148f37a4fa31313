//! # lodestone Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! from the lodestone library. Import this module to get quick access to the essential
//! types for mapping modules into a modeled process.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all lodestone operations
pub use crate::Error;

/// The result type used throughout lodestone
pub use crate::Result;

// ================================================================================================
// Main Entry Points
// ================================================================================================

/// Configures and runs one mapping
pub use crate::mapper::ModuleMapper;

/// Handle to a successfully mapped module
pub use crate::mapper::MappedModule;

/// Mapping behaviour flags and dependency redirect policy
pub use crate::mapper::{MappingConfig, MappingFlags, SxsPolicy};

/// The modeled process everything is mapped into
pub use crate::process::ProcessSpace;

/// One mapped module as the process sees it
pub use crate::process::ModuleRecord;

// ================================================================================================
// Image Format
// ================================================================================================

/// A parsed, validated module image
pub use crate::image::ModuleImage;

/// Assembles well-formed module images
pub use crate::image::builder::ImageBuilder;

/// Architecture width of an image
pub use crate::image::format::PlatformAbi;

/// Final protection of a mapped section
pub use crate::image::format::SectionProtection;

/// Import bindings by name or ordinal
pub use crate::image::imports::ImportTarget;

// ================================================================================================
// Runtime Surface
// ================================================================================================

/// Why a module's entry point or callback is being invoked
pub use crate::process::routines::NotificationReason;

/// The context a routine observes while it runs
pub use crate::process::routines::RoutineFrame;

/// Low-level little-endian parsing utilities
pub use crate::Parser;
