//! Repository names and manifest references.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::digest::Digest;
use crate::error::RegistryError;

static NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[._-][a-z0-9]+)*(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)*$")
        .expect("name pattern")
});

static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]{0,127}$").expect("tag pattern"));

const MAX_NAME_LENGTH: usize = 255;

/// A validated repository name such as `library/alpine`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryName(String);

impl RepositoryName {
    /// Validate a repository name against the distribution name grammar.
    pub fn parse(name: &str) -> Result<Self, RegistryError> {
        if name.len() > MAX_NAME_LENGTH || !NAME.is_match(name) {
            return Err(RegistryError::NameInvalid(name.to_owned()));
        }
        Ok(Self(name.to_owned()))
    }

    /// The namespace owning this repository: the first path component.
    pub fn namespace(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }

    /// The name as sent.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepositoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether `tag` is a legal tag name.
pub fn is_valid_tag(tag: &str) -> bool {
    TAG.is_match(tag)
}

/// A manifest reference: either a tag or a digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// A mutable tag name.
    Tag(String),
    /// A content digest.
    Digest(Digest),
}

impl Reference {
    /// Digests contain `:`, tags never do.
    pub fn parse(reference: &str) -> Result<Self, RegistryError> {
        if reference.contains(':') {
            let digest = reference
                .parse()
                .map_err(|err| RegistryError::DigestInvalid(format!("{err}")))?;
            return Ok(Reference::Digest(digest));
        }

        if !is_valid_tag(reference) {
            return Err(RegistryError::TagInvalid(reference.to_owned()));
        }
        Ok(Reference::Tag(reference.to_owned()))
    }

    /// The tag, for tag references.
    pub fn tag(&self) -> Option<&str> {
        match self {
            Reference::Tag(tag) => Some(tag),
            Reference::Digest(_) => None,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Tag(tag) => f.write_str(tag),
            Reference::Digest(digest) => digest.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        for name in ["alpine", "library/alpine", "a/b-c/d_e", "x.y/z__z"] {
            assert!(RepositoryName::parse(name).is_ok(), "{name}");
        }
        for name in ["", "Alpine", "a//b", "/a", "a/", "a-", "a/-b", "a/../b"] {
            assert!(RepositoryName::parse(name).is_err(), "{name}");
        }
    }

    #[test]
    fn namespace_is_first_component() {
        let name = RepositoryName::parse("library/alpine").unwrap();
        assert_eq!(name.namespace(), "library");
        let name = RepositoryName::parse("alpine").unwrap();
        assert_eq!(name.namespace(), "alpine");
    }

    #[test]
    fn references() {
        assert_eq!(
            Reference::parse("latest").unwrap(),
            Reference::Tag("latest".into())
        );
        assert!(matches!(
            Reference::parse("sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"),
            Ok(Reference::Digest(_))
        ));
        assert!(matches!(
            Reference::parse(".hidden"),
            Err(RegistryError::TagInvalid(_))
        ));
        assert!(matches!(
            Reference::parse("sha256:nope"),
            Err(RegistryError::DigestInvalid(_))
        ));
        assert!(!is_valid_tag(&"a".repeat(129)));
    }
}
