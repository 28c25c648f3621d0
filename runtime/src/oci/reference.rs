//! Registry image reference parsing.
//!
//! Turns the part after `docker://` or `registry://` into registry,
//! repository, tag and digest.

use stratum_core::error::{BuildError, Result};
use stratum_core::Digest;

/// Registry used when the reference names none.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Tag used when the reference has neither tag nor digest.
pub const DEFAULT_TAG: &str = "latest";

/// Parsed registry image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host, with port if any (e.g. "ghcr.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g. "library/alpine")
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<Digest>,
}

impl ImageReference {
    /// Parse a reference string.
    ///
    /// - `alpine` → docker.io/library/alpine:latest
    /// - `alpine:3.19` → docker.io/library/alpine:3.19
    /// - `ghcr.io/org/app@sha256:…` → pinned by digest
    /// - `localhost:5000/app` → local registry with port
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim().trim_start_matches('/');
        if reference.is_empty() {
            return Err(BuildError::ManifestParse(
                "Empty image reference".to_string(),
            ));
        }

        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name, digest)) => {
                let digest = Digest::parse(digest).map_err(|e| {
                    BuildError::ManifestParse(format!(
                        "Invalid digest in reference '{}': {}",
                        reference, e
                    ))
                })?;
                (name, Some(digest))
            }
            None => (reference, None),
        };

        let (name, tag) = split_tag(name_tag);
        if let Some(tag) = tag {
            validate_tag(tag, reference)?;
        }
        let (registry, repository) = split_registry(name)?;

        let tag = match (tag, &digest) {
            (Some(t), _) => Some(t.to_string()),
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (None, Some(_)) => None,
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Reference string understood by registry clients.
    ///
    /// A digest takes precedence over the tag since it pins the content.
    pub fn pull_reference(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => format!("{}/{}@{}", self.registry, self.repository, digest),
            (None, Some(tag)) => format!("{}/{}:{}", self.registry, self.repository, tag),
            (None, None) => format!("{}/{}:{}", self.registry, self.repository, DEFAULT_TAG),
        }
    }

    /// Full reference including both tag and digest.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(tag) = &self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            s.push('@');
            s.push_str(&digest.to_string());
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full_reference())
    }
}

/// Split `name[:tag]`, where the tag colon must follow the last `/`
/// (otherwise it is a registry port).
fn split_tag(name_tag: &str) -> (&str, Option<&str>) {
    let last_segment_start = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
    match name_tag[last_segment_start..].rfind(':') {
        Some(colon) => {
            let split = last_segment_start + colon;
            (&name_tag[..split], Some(&name_tag[split + 1..]))
        }
        None => (name_tag, None),
    }
}

fn validate_tag(tag: &str, reference: &str) -> Result<()> {
    let valid = !tag.is_empty()
        && tag.len() <= 128
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(BuildError::ManifestParse(format!(
            "Invalid tag '{}' in reference '{}'",
            tag, reference
        )))
    }
}

/// The first component is a registry if it looks like a host.
fn split_registry(name: &str) -> Result<(String, String)> {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if rest.is_empty() {
                return Err(BuildError::ManifestParse(format!(
                    "Empty repository in reference '{}'",
                    name
                )));
            }
            return Ok((first.to_string(), rest.to_string()));
        }
    }

    if name.is_empty() {
        return Err(BuildError::ManifestParse(
            "Empty repository name".to_string(),
        ));
    }

    let repository = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{}", name)
    };
    Ok((DEFAULT_REGISTRY.to_string(), repository))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890";

    #[test]
    fn test_parse_simple_name() {
        let r = ImageReference::parse("alpine").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/alpine");
        assert_eq!(r.tag.as_deref(), Some("latest"));
        assert!(r.digest.is_none());
    }

    #[test]
    fn test_parse_name_with_tag() {
        let r = ImageReference::parse("alpine:3.19").unwrap();
        assert_eq!(r.repository, "library/alpine");
        assert_eq!(r.tag.as_deref(), Some("3.19"));
    }

    #[test]
    fn test_parse_user_repo() {
        let r = ImageReference::parse("someuser/tool:v2").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "someuser/tool");
        assert_eq!(r.tag.as_deref(), Some("v2"));
    }

    #[test]
    fn test_parse_leading_slashes_from_uri() {
        let r = ImageReference::parse("//alpine").unwrap();
        assert_eq!(r.repository, "library/alpine");
    }

    #[test]
    fn test_parse_custom_registry_with_port() {
        let r = ImageReference::parse("registry.local:5000/team/app:1.0").unwrap();
        assert_eq!(r.registry, "registry.local:5000");
        assert_eq!(r.repository, "team/app");
        assert_eq!(r.tag.as_deref(), Some("1.0"));
    }

    #[test]
    fn test_parse_localhost() {
        let r = ImageReference::parse("localhost/app").unwrap();
        assert_eq!(r.registry, "localhost");
        assert_eq!(r.repository, "app");
    }

    #[test]
    fn test_parse_digest_only() {
        let r = ImageReference::parse(&format!("ghcr.io/org/app@sha256:{}", HEX)).unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "org/app");
        assert!(r.tag.is_none());
        assert_eq!(r.digest.unwrap().hex(), HEX);
    }

    #[test]
    fn test_parse_tag_and_digest() {
        let r = ImageReference::parse(&format!("ghcr.io/org/app:v1@sha256:{}", HEX)).unwrap();
        assert_eq!(r.tag.as_deref(), Some("v1"));
        assert!(r.digest.is_some());
        assert_eq!(
            r.pull_reference(),
            format!("ghcr.io/org/app@sha256:{}", HEX)
        );
    }

    #[test]
    fn test_parse_rejects_bad_digest() {
        let err = ImageReference::parse("alpine@sha256:short").unwrap_err();
        assert!(matches!(err, BuildError::ManifestParse(_)));
        assert!(ImageReference::parse("alpine@md5:abc").is_err());
    }

    #[test]
    fn test_parse_rejects_bad_tag() {
        assert!(ImageReference::parse("alpine:").is_err());
        assert!(ImageReference::parse("alpine:bad tag").is_err());
    }

    #[test]
    fn test_parse_empty() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("   ").is_err());
        assert!(ImageReference::parse("ghcr.io/").is_err());
    }

    #[test]
    fn test_pull_reference_uses_tag() {
        let r = ImageReference::parse("alpine:3.19").unwrap();
        assert_eq!(r.pull_reference(), "docker.io/library/alpine:3.19");
        assert_eq!(r.to_string(), "docker.io/library/alpine:3.19");
    }

    #[test]
    fn test_deep_repository_path() {
        let r = ImageReference::parse("ghcr.io/org/sub/image:v1").unwrap();
        assert_eq!(r.repository, "org/sub/image");
    }
}
