//! Base image references and the image working directory.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use crate::Error;

/// A container image reference: `[registry[:port]/]path[:tag][@sha256:<hex>]`.
///
/// ```
/// use kiln_core::ImageRef;
///
/// let image: ImageRef = "python:3.11-slim".parse().unwrap();
/// assert_eq!(image.repository, "python");
/// assert_eq!(image.tag.as_deref(), Some("3.11-slim"));
/// assert_eq!(image.to_string(), "python:3.11-slim");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageRef {
    pub fn parse(reference: &str) -> crate::Result<Self> {
        let invalid = |reason| Error::InvalidImageRef {
            reference: reference.to_owned(),
            reason,
        };

        if reference.is_empty() {
            return Err(invalid("reference is empty"));
        }
        if reference.chars().any(char::is_whitespace) {
            return Err(invalid("reference contains whitespace"));
        }

        let (name, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                validate_digest(digest).map_err(invalid)?;
                (name, Some(digest.to_owned()))
            }
            None => (reference, None),
        };

        // A colon after the last slash separates the tag; earlier colons
        // belong to a registry port.
        let (repository, tag) = match name.rfind(':') {
            Some(idx) if !name[idx..].contains('/') => {
                let tag = &name[idx + 1..];
                validate_tag(tag).map_err(invalid)?;
                (&name[..idx], Some(tag.to_owned()))
            }
            _ => (name, None),
        };

        validate_repository(repository).map_err(invalid)?;

        Ok(Self {
            repository: repository.to_owned(),
            tag,
            digest,
        })
    }

    /// The tag to use when neither tag nor digest was given.
    pub fn effective_tag(&self) -> Option<&str> {
        match (&self.tag, &self.digest) {
            (Some(tag), _) => Some(tag),
            (None, None) => Some("latest"),
            (None, Some(_)) => None,
        }
    }
}

impl std::str::FromStr for ImageRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

fn validate_digest(digest: &str) -> Result<(), &'static str> {
    let hex = digest
        .strip_prefix("sha256:")
        .ok_or("digest must start with sha256:")?;
    if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err("digest must be 64 hex characters");
    }
    Ok(())
}

fn validate_tag(tag: &str) -> Result<(), &'static str> {
    if tag.is_empty() || tag.len() > 128 {
        return Err("tag must be 1-128 characters");
    }
    if tag.starts_with(['.', '-']) {
        return Err("tag must not start with '.' or '-'");
    }
    if !tag
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err("tag contains invalid characters");
    }
    Ok(())
}

fn validate_repository(repository: &str) -> Result<(), &'static str> {
    if repository.is_empty() {
        return Err("repository is empty");
    }
    let components: Vec<&str> = repository.split('/').collect();
    for (i, component) in components.iter().enumerate() {
        if component.is_empty() {
            return Err("repository has an empty path component");
        }
        // The first of several components may be a registry host.
        let is_registry = i == 0
            && components.len() > 1
            && (component.contains(['.', ':']) || *component == "localhost");
        let valid = if is_registry {
            component
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':'))
        } else {
            component.chars().all(|c| {
                c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-')
            }) && component.starts_with(|c: char| c.is_ascii_alphanumeric())
        };
        if !valid {
            return Err("repository components must be lowercase alphanumerics, '.', '_' or '-'");
        }
    }
    Ok(())
}

/// Absolute, normalised working directory inside the image.
///
/// Every staged layer lives below it, so it is checked once up front
/// rather than at each copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDir(PathBuf);

impl WorkDir {
    pub fn new(path: &str) -> crate::Result<Self> {
        let invalid = |reason| Error::InvalidWorkDir {
            path: path.to_owned(),
            reason,
        };

        let p = Path::new(path);
        if !p.has_root() {
            return Err(invalid("must be an absolute path"));
        }

        let mut normalised = PathBuf::from("/");
        for component in p.components() {
            match component {
                Component::RootDir => {}
                Component::Normal(part) => normalised.push(part),
                Component::CurDir | Component::ParentDir => {
                    return Err(invalid("must not contain '.' or '..' components"));
                }
                Component::Prefix(_) => return Err(invalid("must be a unix-style path")),
            }
        }
        Ok(Self(normalised))
    }

    /// The absolute path, e.g. `/app`.
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// The path without its root, e.g. `app`; empty for `/`.
    pub fn relative(&self) -> PathBuf {
        self.0.components().skip(1).collect()
    }
}

impl fmt::Display for WorkDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}
