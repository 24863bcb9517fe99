//! Launch command, entry-point references and bind targets.
//!
//! The launch command is recorded in the image as a plain argv vector and
//! is not validated at build time. At launch it is parsed into a
//! [`LaunchPlan`]; the entry point is checked first, the bind parameters
//! only once binding starts.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Host the server binds when the command carries no `--host` flag.
///
/// Mirrors uvicorn's own default; `kiln.toml` writes an explicit `--host`
/// (default `0.0.0.0`) into every recorded command.
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Port the server binds when the command carries no `--port` flag.
pub const DEFAULT_PORT: u16 = 8000;

/// Reference to the loadable server application: `<module-path>:<object-name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    /// Dotted module path, e.g. `app.main`
    pub module: String,
    /// Object inside the module, e.g. `app`; may be a dotted attribute chain
    pub object: String,
}

impl EntryPoint {
    pub fn parse(reference: &str) -> crate::Result<Self> {
        let invalid = |reason| Error::InvalidEntryPoint {
            reference: reference.to_owned(),
            reason,
        };

        let (module, object) = reference
            .split_once(':')
            .ok_or_else(|| invalid("expected <module-path>:<object-name>"))?;
        if object.contains(':') {
            return Err(invalid("more than one ':'"));
        }
        if !is_dotted_identifier(module) {
            return Err(invalid("module path must be dot-separated identifiers"));
        }
        if !is_dotted_identifier(object) {
            return Err(invalid("object name must be an identifier"));
        }

        Ok(Self {
            module: module.to_owned(),
            object: object.to_owned(),
        })
    }

    /// Top-level name the module must define (`app` for `app.router`).
    pub fn top_level_name(&self) -> &str {
        self.object.split('.').next().unwrap_or(&self.object)
    }

    /// Candidate source files, relative to the application root, in lookup order:
    /// `a/b.<suffix>` then `a/b/__init__.<suffix>`.
    pub fn module_candidates(&self, suffix: &str) -> [PathBuf; 2] {
        let base: PathBuf = self.module.split('.').collect();
        [
            base.with_extension(suffix),
            base.join(format!("__init__.{suffix}")),
        ]
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.object)
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_dotted_identifier(s: &str) -> bool {
    !s.is_empty() && s.split('.').all(is_identifier)
}

/// Validated host/port pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindTarget {
    pub host: String,
    pub port: u16,
}

impl BindTarget {
    pub fn parse(host: &str, port: &str) -> crate::Result<Self> {
        let port = match port.parse::<u16>() {
            Ok(p) if p != 0 => p,
            _ => {
                return Err(Error::InvalidPort {
                    value: port.to_owned(),
                });
            }
        };

        let bare = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if bare.parse::<IpAddr>().is_err() && !is_hostname(bare) {
            return Err(Error::InvalidHost {
                host: host.to_owned(),
            });
        }

        Ok(Self {
            host: bare.to_owned(),
            port,
        })
    }
}

impl fmt::Display for BindTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn is_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    host.trim_end_matches('.').split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

/// The fixed argv executed at container start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LaunchCommand(Vec<String>);

impl LaunchCommand {
    pub fn new(argv: Vec<String>) -> Self {
        Self(argv)
    }

    pub fn argv(&self) -> &[String] {
        &self.0
    }

    /// Splits the command into program, entry point and raw bind parameters.
    ///
    /// Recognises `--host X`, `--host=X`, `--port N`, `--port=N`; the first
    /// positional argument containing `:` is the entry point. A trailing
    /// flag without a value is reported by [`LaunchPlan::bind_target`], so
    /// the entry point is still checked first.
    pub fn plan(&self) -> crate::Result<LaunchPlan> {
        let (program, args) = self.0.split_first().ok_or(Error::EmptyLaunchCommand)?;

        let mut entry_point = None;
        let mut host = None;
        let mut port = None;
        let mut dangling_flag = None;

        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            if let Some(value) = arg.strip_prefix("--host=") {
                host = Some(value.to_owned());
            } else if let Some(value) = arg.strip_prefix("--port=") {
                port = Some(value.to_owned());
            } else if arg == "--host" || arg == "--port" {
                let Some(value) = iter.next() else {
                    dangling_flag = Some(arg.clone());
                    break;
                };
                if arg == "--host" {
                    host = Some(value.clone());
                } else {
                    port = Some(value.clone());
                }
            } else if arg.starts_with('-') {
                continue;
            } else if entry_point.is_none() && arg.contains(':') {
                entry_point = Some(EntryPoint::parse(arg)?);
            }
        }

        Ok(LaunchPlan {
            program: program.clone(),
            args: args.to_vec(),
            entry_point: entry_point.ok_or(Error::MissingEntryPoint)?,
            host: host.unwrap_or_else(|| DEFAULT_HOST.to_owned()),
            port: port.unwrap_or_else(|| DEFAULT_PORT.to_string()),
            dangling_flag,
        })
    }
}

impl fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

/// A parsed launch command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: String,
    /// Arguments after the program, unchanged
    pub args: Vec<String>,
    pub entry_point: EntryPoint,
    host: String,
    port: String,
    dangling_flag: Option<String>,
}

impl LaunchPlan {
    /// Validates the bind parameters.
    pub fn bind_target(&self) -> crate::Result<BindTarget> {
        if let Some(flag) = &self.dangling_flag {
            return Err(Error::MissingFlagValue { flag: flag.clone() });
        }
        BindTarget::parse(&self.host, &self.port)
    }
}
