//! Thread-local storage directory.
//!
//! Describes the per-thread data template (plus trailing zero-fill) instantiated for
//! every thread that touches the module, and the ordered callback list the entry
//! invoker fires ahead of the entry routine on every lifecycle notification.

use crate::{image::parser::Parser, Result};

/// The parsed TLS directory of an image. One per module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsDirectory {
    /// RVA of the initialisation template within the image
    pub template_rva: u32,
    /// Length of the template in bytes
    pub template_size: u32,
    /// Zero-filled bytes appended after the template in each instantiation
    pub zero_fill: u32,
    /// Callback RVAs in invocation order
    pub callbacks: Vec<u32>,
}

impl TlsDirectory {
    /// Parse the TLS directory payload.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] on truncation or
    /// [`crate::Error::Malformed`] if the directory describes no per-thread data at all.
    pub fn parse(data: &[u8]) -> Result<TlsDirectory> {
        let mut parser = Parser::new(data);

        let template_rva = parser.read_u32()?;
        let template_size = parser.read_u32()?;
        let zero_fill = parser.read_u32()?;
        let callback_count = parser.read_u32()? as usize;

        let mut callbacks = Vec::with_capacity(callback_count);
        for _ in 0..callback_count {
            callbacks.push(parser.read_u32()?);
        }

        if template_size == 0 && zero_fill == 0 {
            return Err(malformed_error!(
                "TLS directory describes no per-thread data"
            ));
        }

        Ok(TlsDirectory {
            template_rva,
            template_size,
            zero_fill,
            callbacks,
        })
    }

    /// Total per-thread instantiation size: template plus zero-fill.
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.template_size as usize + self.zero_fill as usize
    }
}
