//! Activation context resolution.
//!
//! An image may embed a side-by-side manifest naming versioned assembly
//! identities for some of its dependencies. While that module's imports are
//! being resolved, its manifest forms the active context: a dependency whose
//! name matches a declared identity is redirected to a versioned store origin
//! instead of its plain name. The context is scoped to the module that owns
//! the manifest; dependencies bring their own manifests for their own imports.
//!
//! Resolution is driven entirely by the mapping configuration. Under the
//! side-by-side policy a declared redirect is authoritative, and a missing
//! redirected image is an error rather than a silent fallback to the plain
//! name, so the same inputs always map the same set of images.

use quick_xml::{events::Event, Reader};
use sha1::{Digest, Sha1};

use crate::{
    image::format::PlatformAbi,
    mapper::SxsPolicy,
    process::store::ImageStore,
    Result,
};

/// One `assemblyIdentity` declared under a `dependentAssembly` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyIdentity {
    /// Assembly name, matched against the dependency file stem
    pub name: String,
    /// Four-part version string
    pub version: String,
    /// Processor architecture, wildcards already resolved
    pub architecture: String,
    /// Publisher public key token
    pub token: String,
    /// Language, wildcards already resolved to `none`
    pub language: String,
}

impl AssemblyIdentity {
    /// The store directory this identity redirects into.
    #[must_use]
    pub fn store_directory(&self) -> String {
        let stem = format!(
            "{}_{}_{}_{}",
            self.architecture, self.name, self.token, self.version
        );

        let mut hasher = Sha1::new();
        hasher.update(stem.as_bytes());
        let digest = hasher.finalize();
        let hash: String = digest
            .iter()
            .take(4)
            .map(|byte| format!("{byte:02x}"))
            .collect();

        format!("sxs/{stem}_{hash}")
    }
}

/// The redirects a module's manifest declares.
#[derive(Debug, Clone, Default)]
pub struct ActivationContext {
    identities: Vec<AssemblyIdentity>,
}

fn architecture_label(abi: PlatformAbi) -> &'static str {
    match abi {
        PlatformAbi::Width32 => "x86",
        PlatformAbi::Width64 => "amd64",
    }
}

impl ActivationContext {
    /// Parse a manifest into a context, resolving wildcard attributes against
    /// the owning image's architecture.
    ///
    /// Only identities nested under `dependency/dependentAssembly` are taken;
    /// the root `assemblyIdentity` describes the module itself.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for unparseable XML or an identity
    /// missing its name or version.
    pub fn parse(xml: &[u8], abi: PlatformAbi) -> Result<ActivationContext> {
        let text = std::str::from_utf8(xml)
            .map_err(|_| malformed_error!("Manifest is not valid UTF-8"))?;

        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);

        let mut identities = Vec::new();
        let mut dependent_depth = 0usize;

        loop {
            match reader.read_event() {
                Ok(Event::Start(element)) => {
                    let name = element.name();
                    if name.as_ref() == b"dependentAssembly" {
                        dependent_depth += 1;
                    } else if name.as_ref() == b"assemblyIdentity" && dependent_depth > 0 {
                        identities.push(Self::parse_identity(&element, abi)?);
                    }
                }
                Ok(Event::Empty(element)) => {
                    if element.name().as_ref() == b"assemblyIdentity" && dependent_depth > 0 {
                        identities.push(Self::parse_identity(&element, abi)?);
                    }
                }
                Ok(Event::End(element)) => {
                    if element.name().as_ref() == b"dependentAssembly" {
                        dependent_depth = dependent_depth.saturating_sub(1);
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(malformed_error!("Manifest XML error: {}", e)),
            }
        }

        Ok(ActivationContext { identities })
    }

    fn parse_identity(
        element: &quick_xml::events::BytesStart,
        abi: PlatformAbi,
    ) -> Result<AssemblyIdentity> {
        let mut name = None;
        let mut version = None;
        let mut architecture = None;
        let mut token = None;
        let mut language = None;

        for attribute in element.attributes() {
            let attribute =
                attribute.map_err(|e| malformed_error!("Manifest attribute error: {}", e))?;
            let value = attribute
                .unescape_value()
                .map_err(|e| malformed_error!("Manifest attribute error: {}", e))?
                .into_owned();

            match attribute.key.as_ref() {
                b"name" => name = Some(value),
                b"version" => version = Some(value),
                b"processorArchitecture" => architecture = Some(value),
                b"publicKeyToken" => token = Some(value),
                b"language" => language = Some(value),
                _ => {}
            }
        }

        let name = name.ok_or_else(|| malformed_error!("Assembly identity without a name"))?;
        let version =
            version.ok_or_else(|| malformed_error!("Assembly identity without a version"))?;

        let architecture = match architecture.as_deref() {
            None | Some("*") => architecture_label(abi).to_string(),
            Some(explicit) => explicit.to_string(),
        };
        let language = match language.as_deref() {
            None | Some("*") => "none".to_string(),
            Some(explicit) => explicit.to_string(),
        };

        Ok(AssemblyIdentity {
            name,
            version,
            architecture,
            token: token.unwrap_or_default(),
            language,
        })
    }

    /// The identities declared by the manifest, in document order.
    #[must_use]
    pub fn identities(&self) -> &[AssemblyIdentity] {
        &self.identities
    }

    /// The identity redirecting `dependency`, matched by file stem.
    #[must_use]
    pub fn identity_for(&self, dependency: &str) -> Option<&AssemblyIdentity> {
        let stem = dependency.split('.').next().unwrap_or(dependency);
        self.identities
            .iter()
            .find(|identity| identity.name == stem)
    }
}

/// Resolve a dependency name to the store origin mapping should load.
///
/// Under [`SxsPolicy::Private`] the context is ignored and the plain name is
/// used. Under [`SxsPolicy::SideBySide`] a matching identity redirects to its
/// versioned store directory, and the redirected image must be published.
///
/// # Errors
/// Returns [`crate::Error::DependencyNotFound`] when a redirect points at an
/// unpublished origin.
pub(crate) fn resolve_origin(
    context: Option<&ActivationContext>,
    store: &ImageStore,
    dependency: &str,
    policy: SxsPolicy,
) -> Result<String> {
    if policy == SxsPolicy::Private {
        return Ok(dependency.to_string());
    }

    let Some(identity) = context.and_then(|context| context.identity_for(dependency)) else {
        return Ok(dependency.to_string());
    };

    let origin = format!("{}/{}", identity.store_directory(), dependency);
    if !store.contains(&origin) {
        return Err(crate::Error::DependencyNotFound { dependency: origin });
    }

    Ok(origin)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<assembly xmlns="urn:schemas-microsoft-com:asm.v1" manifestVersion="1.0">
  <dependency>
    <dependentAssembly>
      <assemblyIdentity type="win32" name="dep" version="1.0.0.0"
                        processorArchitecture="*" publicKeyToken="6595b64144ccf1df" language="*"/>
    </dependentAssembly>
  </dependency>
</assembly>"#;

    #[test]
    fn parses_dependent_identities() {
        let context = ActivationContext::parse(MANIFEST.as_bytes(), PlatformAbi::Width64).unwrap();

        let identities = context.identities();
        assert_eq!(identities.len(), 1);
        assert_eq!(identities[0].name, "dep");
        assert_eq!(identities[0].version, "1.0.0.0");
        assert_eq!(identities[0].architecture, "amd64");
        assert_eq!(identities[0].language, "none");
    }

    #[test]
    fn wildcard_architecture_follows_abi() {
        let context = ActivationContext::parse(MANIFEST.as_bytes(), PlatformAbi::Width32).unwrap();
        assert_eq!(context.identities()[0].architecture, "x86");
    }

    #[test]
    fn root_identity_ignored() {
        let xml = r#"<assembly manifestVersion="1.0">
  <assemblyIdentity name="self" version="1.0.0.0"/>
</assembly>"#;
        let context = ActivationContext::parse(xml.as_bytes(), PlatformAbi::Width64).unwrap();
        assert!(context.identities().is_empty());
    }

    #[test]
    fn store_directory_is_deterministic() {
        let context = ActivationContext::parse(MANIFEST.as_bytes(), PlatformAbi::Width64).unwrap();
        let first = context.identities()[0].store_directory();
        let second = context.identities()[0].store_directory();

        assert_eq!(first, second);
        assert!(first.starts_with("sxs/amd64_dep_6595b64144ccf1df_1.0.0.0_"));
    }

    #[test]
    fn side_by_side_requires_published_redirect() {
        let context = ActivationContext::parse(MANIFEST.as_bytes(), PlatformAbi::Width64).unwrap();
        let store = ImageStore::new();

        // The redirect is authoritative; a missing redirected image is an error
        assert!(resolve_origin(Some(&context), &store, "dep.lmd", SxsPolicy::SideBySide).is_err());

        let origin = format!("{}/dep.lmd", context.identities()[0].store_directory());
        store.publish(&origin, vec![]);
        let resolved =
            resolve_origin(Some(&context), &store, "dep.lmd", SxsPolicy::SideBySide).unwrap();
        assert_eq!(resolved, origin);
    }

    #[test]
    fn private_policy_ignores_redirects() {
        let context = ActivationContext::parse(MANIFEST.as_bytes(), PlatformAbi::Width64).unwrap();
        let store = ImageStore::new();

        let resolved =
            resolve_origin(Some(&context), &store, "dep.lmd", SxsPolicy::Private).unwrap();
        assert_eq!(resolved, "dep.lmd");
    }

    #[test]
    fn unmatched_dependency_uses_plain_name() {
        let context = ActivationContext::parse(MANIFEST.as_bytes(), PlatformAbi::Width64).unwrap();
        let store = ImageStore::new();

        let resolved =
            resolve_origin(Some(&context), &store, "other.lmd", SxsPolicy::SideBySide).unwrap();
        assert_eq!(resolved, "other.lmd");
    }

    #[test]
    fn malformed_manifest_rejected() {
        assert!(ActivationContext::parse(b"<assembly", PlatformAbi::Width64).is_err());
        assert!(ActivationContext::parse(
            br#"<assembly><dependency><dependentAssembly>
                <assemblyIdentity version="1.0.0.0"/>
               </dependentAssembly></dependency></assembly>"#,
            PlatformAbi::Width64
        )
        .is_err());
    }
}
