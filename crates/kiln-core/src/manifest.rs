//! Dependency manifest parsing (requirements-file format).

use std::path::{Path, PathBuf};

/// One declared dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    /// Package name as written, without extras
    pub name: String,
    /// Extras requested in brackets, e.g. `uvicorn[standard]`
    pub extras: Vec<String>,
    /// Version constraint and markers, e.g. `>=0.30,<1` or `==1.2; python_version < "3.12"`
    pub constraint: Option<String>,
    /// 1-based line number in the manifest
    pub line: usize,
}

/// The dependency manifest read once at build time.
#[derive(Debug, Clone)]
pub struct DependencyManifest {
    pub path: PathBuf,
    pub requirements: Vec<Requirement>,
    /// Installer option lines (`-r other.txt`, `--index-url ...`), passed through untouched
    pub options: Vec<String>,
}

impl DependencyManifest {
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| crate::Error::ManifestRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(path, &content)
    }

    pub fn parse(path: &Path, content: &str) -> crate::Result<Self> {
        let mut requirements = Vec::new();
        let mut options = Vec::new();

        for (idx, raw) in content.lines().enumerate() {
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('-') {
                options.push(line.to_owned());
                continue;
            }
            let requirement =
                parse_requirement(line, idx + 1).map_err(|detail| crate::Error::ManifestParse {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    detail,
                })?;
            requirements.push(requirement);
        }

        tracing::debug!(
            path = %path.display(),
            requirements = requirements.len(),
            options = options.len(),
            "parsed dependency manifest"
        );

        Ok(Self {
            path: path.to_path_buf(),
            requirements,
            options,
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.requirements.iter().map(|r| r.name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty() && self.options.is_empty()
    }
}

/// Drops a `#` comment. A `#` only starts a comment at line start or after
/// whitespace, so URL fragments survive.
fn strip_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'#' && (i == 0 || bytes[i - 1].is_ascii_whitespace()) {
            return &line[..i];
        }
    }
    line
}

fn parse_requirement(line: &str, line_no: usize) -> Result<Requirement, String> {
    let name_end = line
        .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        .unwrap_or(line.len());
    let name = &line[..name_end];

    if name.is_empty() {
        return Err(format!("expected a package name, found {line:?}"));
    }
    if !name.starts_with(|c: char| c.is_ascii_alphanumeric())
        || !name.ends_with(|c: char| c.is_ascii_alphanumeric())
    {
        return Err(format!(
            "package name {name:?} must start and end with a letter or digit"
        ));
    }

    let mut rest = line[name_end..].trim_start();
    let mut extras = Vec::new();
    if let Some(after) = rest.strip_prefix('[') {
        let close = after
            .find(']')
            .ok_or_else(|| format!("unterminated extras in {line:?}"))?;
        extras = after[..close]
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_owned)
            .collect();
        rest = after[close + 1..].trim_start();
    }

    let constraint = if rest.is_empty() {
        None
    } else if rest.starts_with(['=', '<', '>', '!', '~', ';', '@', '(']) {
        Some(rest.to_owned())
    } else {
        return Err(format!("unexpected {rest:?} after package name {name:?}"));
    };

    Ok(Requirement {
        name: name.to_owned(),
        extras,
        constraint,
        line: line_no,
    })
}
