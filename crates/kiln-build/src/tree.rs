use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Paths kiln always leaves out of an application tree,
/// regardless of configured excludes.
const KILN_EXCLUDES: &[&str] = &[".git", ".kiln"];

/// One filesystem entry of a source tree, relative to the tree root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub relative: PathBuf,
    pub source: PathBuf,
    pub kind: EntryKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File { executable: bool },
    Symlink { target: PathBuf },
}

/// Walks `root` and returns every entry below it in sorted order.
///
/// `excludes` are path prefixes relative to `root` (`"tests/"`, `"docs"`);
/// an excluded directory is not descended into.
pub fn collect_tree(root: &Path, excludes: &[String]) -> Result<Vec<TreeEntry>, CopyError> {
    if !root.is_dir() {
        return Err(CopyError::SourceMissing(root.to_path_buf()));
    }

    let excludes: Vec<PathBuf> = KILN_EXCLUDES
        .iter()
        .map(PathBuf::from)
        .chain(
            excludes
                .iter()
                .map(|e| PathBuf::from(e.trim_end_matches('/')))
                .filter(|p| !p.as_os_str().is_empty()),
        )
        .collect();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| match entry.path().strip_prefix(root) {
            Ok(relative) => !excludes.iter().any(|ex| relative.starts_with(ex)),
            // arch-lint: allow(no-error-swallowing) reason="entries outside the root are rejected with OutsideRoot below"
            Err(_) => true,
        });

    let mut entries = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|e| CopyError::Walk {
            path: e
                .path()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| root.to_path_buf()),
            source: e,
        })?;
        if entry.depth() == 0 {
            continue;
        }

        let source = entry.path().to_path_buf();
        let relative = source
            .strip_prefix(root)
            .map_err(|_| CopyError::OutsideRoot(source.clone()))?
            .to_path_buf();

        let file_type = entry.file_type();
        let kind = if file_type.is_dir() {
            EntryKind::Dir
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(&source).map_err(|e| CopyError::Read {
                path: source.clone(),
                source: e,
            })?;
            EntryKind::Symlink { target }
        } else {
            let metadata = entry.metadata().map_err(|e| CopyError::Walk {
                path: source.clone(),
                source: e,
            })?;
            EntryKind::File {
                executable: is_executable(&metadata),
            }
        };

        entries.push(TreeEntry {
            relative,
            source,
            kind,
        });
    }

    tracing::debug!(root = %root.display(), entries = entries.len(), "collected tree");
    Ok(entries)
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    false
}

#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    #[error("source tree {0} does not exist or is not a directory")]
    SourceMissing(PathBuf),
    #[error("failed to walk source tree at {path}")]
    Walk {
        path: PathBuf,
        source: walkdir::Error,
    },
    #[error("failed to read {path}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{0} is outside the source tree")]
    OutsideRoot(PathBuf),
    #[error("invalid destination {0:?}: must be relative to the working directory")]
    InvalidDestination(PathBuf),
    #[error("failed to write application layer")]
    Layer(#[from] crate::layer::LayerError),
}
