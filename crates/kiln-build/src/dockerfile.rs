use kiln_core::KilnConfig;

use crate::image::DEPS_DIR;

/// Renders the build recipe as an equivalent Dockerfile.
///
/// Layer order matches the native pipeline: manifest first, installed
/// dependencies second, application tree last.
pub struct DockerfileGenerator<'a> {
    config: &'a KilnConfig,
}

impl<'a> DockerfileGenerator<'a> {
    pub fn new(config: &'a KilnConfig) -> Self {
        Self { config }
    }

    pub fn render(&self) -> String {
        let image = &self.config.image;
        let workdir = image.workdir.trim_end_matches('/');
        let deps_dir = format!("{workdir}/{DEPS_DIR}");

        let manifest_name = image
            .manifest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| image.manifest.display().to_string());
        let manifest_src = image.manifest.display().to_string();

        let mut env_lines = String::new();
        for (key, value) in &image.env {
            env_lines.push_str(&format!("ENV {key}={}\n", quote_env(value)));
        }

        let install_run = if self.config.install.command.is_empty() {
            String::new()
        } else {
            let argv: Vec<String> = self
                .config
                .install
                .command
                .iter()
                .map(|arg| {
                    shell_quote(
                        &arg.replace("{manifest}", &manifest_name)
                            .replace("{target}", &deps_dir),
                    )
                })
                .collect();
            format!("RUN {}\n", argv.join(" "))
        };

        let mut deps_env = match &self.config.install.path_env {
            Some(var) => format!("ENV {var}={deps_dir}\n"),
            None => String::new(),
        };
        // Console scripts of installed packages, such as the server itself.
        deps_env.push_str(&format!("ENV PATH={deps_dir}/bin:$PATH\n"));

        let source = image.source.display().to_string();
        let source = if source.is_empty() || source == "." {
            ".".to_owned()
        } else {
            source
        };

        let cmd = serde_json::Value::from(self.config.launch.command().argv().to_vec());

        format!(
            r#"# Generated by kiln from kiln.toml
FROM {base}
WORKDIR {workdir}
{env_lines}
# === Dependencies (manifest only, cached across source changes) ===
COPY {manifest_src} ./{manifest_name}
{install_run}{deps_env}
# === Application ===
COPY {source} .
EXPOSE {port}
CMD {cmd}
"#,
            base = image.base,
            workdir = if workdir.is_empty() { "/" } else { workdir },
            port = self.config.launch.port,
        )
    }
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@{}".contains(c));
    if safe {
        arg.to_owned()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

fn quote_env(value: &str) -> String {
    if !value.is_empty() && !value.contains(|c: char| c.is_whitespace() || c == '"' || c == '\\') {
        value.to_owned()
    } else {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    }
}
