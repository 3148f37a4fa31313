//! Import directory.
//!
//! Each dependency carries an ordered list of bindings; every binding names an export
//! of the dependency (by name or by ordinal) and the RVA of the slot the resolver
//! patches with the resolved absolute address, at the image's pointer width.

use std::fmt;

use crate::{image::parser::Parser, Result};

/// An imported symbol, referenced by name or by ordinal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportTarget {
    /// Import by export name
    Name(String),
    /// Import by export ordinal
    Ordinal(u32),
}

impl fmt::Display for ImportTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportTarget::Name(name) => write!(f, "{name}"),
            ImportTarget::Ordinal(ordinal) => write!(f, "#{ordinal}"),
        }
    }
}

/// One import binding: which export, and where to patch the resolved address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportBinding {
    /// The export the binding refers to
    pub target: ImportTarget,
    /// RVA of the pointer-width slot receiving the resolved address
    pub slot_rva: u32,
}

/// One imported dependency with its ordered bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportDescriptor {
    /// Identifier of the dependency image
    pub dependency: String,
    /// Bindings in file order
    pub bindings: Vec<ImportBinding>,
}

/// Parse the import directory payload.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] on truncation or [`crate::Error::Malformed`]
/// on an undefined binding tag or invalid name encoding.
pub fn parse_imports(data: &[u8]) -> Result<Vec<ImportDescriptor>> {
    let mut parser = Parser::new(data);
    let dependency_count = parser.read_u32()? as usize;

    let mut descriptors = Vec::with_capacity(dependency_count);

    for _ in 0..dependency_count {
        let dependency = parser.read_prefixed_str()?;
        let binding_count = parser.read_u32()? as usize;

        let mut bindings = Vec::with_capacity(binding_count);

        for _ in 0..binding_count {
            let tag = parser.read_u8()?;

            let target = match tag {
                0 => ImportTarget::Name(parser.read_prefixed_str()?),
                1 => ImportTarget::Ordinal(parser.read_u32()?),
                _ => {
                    return Err(malformed_error!(
                        "Undefined import binding tag {} for {}",
                        tag,
                        dependency
                    ))
                }
            };

            let slot_rva = parser.read_u32()?;
            bindings.push(ImportBinding { target, slot_rva });
        }

        descriptors.push(ImportDescriptor {
            dependency,
            bindings,
        });
    }

    Ok(descriptors)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefixed(name: &str) -> Vec<u8> {
        let mut bytes = (name.len() as u16).to_le_bytes().to_vec();
        bytes.extend_from_slice(name.as_bytes());
        bytes
    }

    #[test]
    fn parses_names_and_ordinals() {
        let mut bytes = 1u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&prefixed("runtime.mod"));
        bytes.extend_from_slice(&2u32.to_le_bytes());
        // by name
        bytes.push(0);
        bytes.extend_from_slice(&prefixed("alloc"));
        bytes.extend_from_slice(&0x3000u32.to_le_bytes());
        // by ordinal
        bytes.push(1);
        bytes.extend_from_slice(&7u32.to_le_bytes());
        bytes.extend_from_slice(&0x3008u32.to_le_bytes());

        let descriptors = parse_imports(&bytes).unwrap();
        assert_eq!(descriptors.len(), 1);

        let descriptor = &descriptors[0];
        assert_eq!(descriptor.dependency, "runtime.mod");
        assert_eq!(descriptor.bindings.len(), 2);
        assert_eq!(
            descriptor.bindings[0].target,
            ImportTarget::Name("alloc".to_string())
        );
        assert_eq!(descriptor.bindings[0].slot_rva, 0x3000);
        assert_eq!(descriptor.bindings[1].target, ImportTarget::Ordinal(7));
        assert_eq!(descriptor.bindings[1].target.to_string(), "#7");
    }

    #[test]
    fn rejects_undefined_tag() {
        let mut bytes = 1u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&prefixed("dep.mod"));
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.push(9);
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());

        assert!(parse_imports(&bytes).is_err());
    }
}
