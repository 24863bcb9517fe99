//! Static entry-point resolution.
//!
//! `a.b:obj` resolves when `a/b.<suffix>` or `a/b/__init__.<suffix>` exists
//! below the application root and binds `obj` at module top level. The
//! module is never executed; only unindented statements are considered.

use std::path::{Path, PathBuf};

use kiln_core::EntryPoint;

/// Locate the module file defining `entry`, returning its path.
pub fn resolve_entry_point(
    app_root: &Path,
    entry: &EntryPoint,
    suffix: &str,
) -> Result<PathBuf, EntryPointError> {
    let candidates = entry.module_candidates(suffix);
    let module_file = candidates
        .iter()
        .map(|c| app_root.join(c))
        .find(|p| p.is_file())
        .ok_or_else(|| EntryPointError::ModuleNotFound {
            module: entry.module.clone(),
            searched: candidates.iter().map(|c| app_root.join(c)).collect(),
        })?;

    let source = std::fs::read_to_string(&module_file).map_err(|e| EntryPointError::Read {
        path: module_file.clone(),
        source: e,
    })?;

    let name = entry.top_level_name();
    if !defines_top_level(&source, name) {
        return Err(EntryPointError::ObjectNotDefined {
            object: name.to_owned(),
            module: entry.module.clone(),
            path: module_file,
        });
    }

    tracing::debug!(entry_point = %entry, module = %module_file.display(), "entry point resolved");
    Ok(module_file)
}

/// Whether `source` binds `name` with an unindented statement.
pub fn defines_top_level(source: &str, name: &str) -> bool {
    source
        .lines()
        .filter(|line| !line.starts_with([' ', '\t']))
        .map(strip_comment)
        .any(|line| line_binds(line, name))
}

fn strip_comment(line: &str) -> &str {
    let code = match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    };
    code.trim_end()
}

fn line_binds(line: &str, name: &str) -> bool {
    if let Some(rest) = line
        .strip_prefix("async def ")
        .or_else(|| line.strip_prefix("def "))
        .or_else(|| line.strip_prefix("class "))
    {
        return leading_identifier(rest.trim_start()) == name;
    }

    if let Some(rest) = line.strip_prefix("from ") {
        return match rest.split_once(" import ") {
            Some((_, names)) => import_list_binds(names, name),
            None => false,
        };
    }

    if let Some(rest) = line.strip_prefix("import ") {
        return rest.split(',').any(|item| {
            let item = item.trim();
            match item.split_once(" as ") {
                Some((_, alias)) => alias.trim() == name,
                None => item.split('.').next() == Some(name),
            }
        });
    }

    assignment_binds(line, name)
}

fn import_list_binds(names: &str, name: &str) -> bool {
    names
        .trim()
        .trim_start_matches('(')
        .trim_end_matches(')')
        .split(',')
        .map(str::trim)
        .any(|item| match item.split_once(" as ") {
            Some((_, alias)) => alias.trim() == name,
            None => item == name,
        })
}

/// `name = ...`, `name: T = ...`, `name: T`, or `a = name = ...`.
fn assignment_binds(line: &str, name: &str) -> bool {
    let mut rest = line;
    loop {
        let target = leading_identifier(rest);
        if target.is_empty() {
            return false;
        }
        let after = rest[target.len()..].trim_start();
        let binds_here = (after.starts_with('=') && !after.starts_with("=="))
            || (after.starts_with(':') && !after.starts_with(":="));
        if !binds_here {
            return false;
        }
        if target == name {
            return true;
        }
        if !after.starts_with('=') {
            return false;
        }
        rest = after[1..].trim_start();
    }
}

fn leading_identifier(s: &str) -> &str {
    let end = s
        .char_indices()
        .find(|(i, c)| !(c.is_alphanumeric() || *c == '_') || (*i == 0 && c.is_numeric()))
        .map_or(s.len(), |(i, _)| i);
    &s[..end]
}

#[derive(Debug, thiserror::Error)]
pub enum EntryPointError {
    #[error("entry point is invalid")]
    Invalid(#[source] kiln_core::Error),

    #[error("module {module} not found (searched {searched:?})")]
    ModuleNotFound {
        module: String,
        searched: Vec<PathBuf>,
    },

    #[error("failed to read module {path}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("module {module} ({path}) does not define {object} at top level")]
    ObjectNotDefined {
        object: String,
        module: String,
        path: PathBuf,
    },
}
