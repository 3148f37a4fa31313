use thiserror::Error;

use crate::process::routines::NotificationReason;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! out_of_bounds_error {
    () => {
        crate::Error::OutOfBounds
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The variants fall into three groups: image parsing failures (a module image that is
/// truncated, inconsistent or of an unsupported flavour), mapping-stage failures (each
/// pipeline stage owns one or more variants so the caller can tell which stage aborted the
/// mapping), and process-space faults raised by the modeled address space itself.
///
/// Any stage failure aborts the owning module's mapping and rolls back every effect the
/// earlier stages already committed; no partially-initialised module is ever returned.
///
/// # Examples
///
/// ```rust,no_run
/// use lodestone::{Error, image::ModuleImage};
/// use std::path::Path;
///
/// match ModuleImage::from_file(Path::new("probe.lmd")) {
///     Ok(image) => println!("parsed image spanning {} bytes", image.size_of_image()),
///     Err(Error::NotSupported) => eprintln!("not a supported image"),
///     Err(Error::Malformed { message, file, line }) => {
///         eprintln!("malformed image: {} ({}:{})", message, file, line);
///     }
///     Err(e) => eprintln!("error: {}", e),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // Image parsing errors
    /// The image is damaged and could not be parsed.
    ///
    /// The error includes the source location where the malformation was detected,
    /// in the same shape the parser helpers produce it.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while parsing the image.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// This image flavour is not supported.
    ///
    /// Raised for a wrong header magic or an architecture width other than 32 or 64.
    #[error("This image type is not supported")]
    NotSupported,

    /// Provided input was empty.
    #[error("Provided input was empty")]
    Empty,

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    // Mapping stage errors
    /// A relocation entry could not be applied.
    ///
    /// Either the relocation kind is unknown, the kind does not match the image's
    /// pointer width, or the rewrite target falls outside the mapped image. Skipping
    /// is never an option, since a skipped relocation corrupts an address every later
    /// stage depends on.
    #[error("Unsupported or invalid relocation kind {kind} at offset {offset:#x}")]
    Relocation {
        /// The raw relocation kind value
        kind: u16,
        /// The RVA the relocation targets
        offset: u32,
    },

    /// A dependency exported no matching routine for an import binding.
    ///
    /// Aborts the entire module's mapping; partial import tables are never left
    /// patched with stale addresses.
    #[error("Failed to resolve the import {symbol} from {dependency}")]
    ImportResolution {
        /// The dependency the binding refers to
        dependency: String,
        /// The imported symbol, by name or `#ordinal`
        symbol: String,
    },

    /// A dependency image could not be located in the target's image store.
    #[error("Failed to resolve the dependency {dependency}")]
    DependencyNotFound {
        /// The unresolved dependency identifier
        dependency: String,
    },

    /// The process-wide TLS slot table is exhausted.
    #[error("The TLS slot table is exhausted")]
    TlsSlotsExhausted,

    /// A TLS access was made through a module that carries no TLS directory.
    #[error("The module carries no thread-local storage")]
    TlsMissing,

    /// A TLS access referred to a slot that is not currently assigned to a module.
    #[error("TLS slot {slot} is not assigned")]
    TlsSlotUnassigned {
        /// The slot index of the failed access
        slot: usize,
    },

    /// The exception directory failed validation or could not be registered.
    ///
    /// The dispatch mechanism relies on ordered lookup, so an unsorted or
    /// overlapping function table is rejected before registration.
    #[error("Exception directory rejected: {0}")]
    ExceptionRegistration(String),

    /// The module's entry routine reported failure for a notification.
    ///
    /// On the attach reason the engine unmaps the module before returning this,
    /// so from the caller's perspective it is indistinguishable from failure
    /// during mapping.
    #[error("The entry routine returned failure for {reason}")]
    EntryPointFailure {
        /// The notification reason the routine rejected
        reason: NotificationReason,
    },

    /// A panic escaped a TLS callback or the entry routine.
    ///
    /// Treated as failure for the notification in flight, but contained; the host
    /// process keeps running.
    #[error("An exception escaped the entry routine during {reason}")]
    EntryPointPanic {
        /// The notification reason in flight when the panic escaped
        reason: NotificationReason,
    },

    // Process-space faults
    /// A read, write or execute touched unmapped memory or violated a protection.
    #[error("Access violation at {address:#x}")]
    AccessViolation {
        /// The faulting address
        address: u64,
    },

    /// Recursion limit reached while mapping transitive dependencies.
    #[error("Reached the maximum dependency depth allowed - {0}")]
    RecursionLimit(usize),

    /// Failed to lock target.
    #[error("Failed to lock target")]
    LockError,
}
