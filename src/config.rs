//! User configuration: load, verify, annotate, template expansion.
//!
//! The config file is YAML with a fixed set of fields. A per-field metadata
//! table carries the human comment for the annotated writer, the verifier
//! selector and the relative-path base; the table is the single source of
//! truth for all three consumers.

use std::fs;
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const DEFAULT_PIES_PORT: u16 = 8073;

const PIES_VERSION_MIN: &str = "1.7.92";

static PIES_VERSION_RX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^pies\s+\(GNU Pies\)\s+(\d+(\.\d+){1,2})").expect("version pattern"));

static PLACEHOLDER_RX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.]*)\s*\}\}").expect("placeholder pattern")
});

const DEFAULT_COMPONENT_TEMPLATE: &str = r#"component "{{ RunnerName }}" {
        mode respawn;
        chdir "{{ Config.runners_dir }}/{{ RunnerName }}";
        stderr syslog daemon.err;
        stdout syslog daemon.info;
        flags siggroup;
        command "./run.sh";
}
"#;

const PIES_CONFIG_STUB: &str = r#"pidfile {{ Config.root_dir }}/pies.pid;
control {
	socket "inet://127.0.0.1:{{ Port }}";
}
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub root_dir: PathBuf,
    pub runners_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub tar: String,
    pub pies: String,
    pub pies_config_file: PathBuf,
    pub component_template: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            root_dir: PathBuf::new(),
            runners_dir: PathBuf::new(),
            cache_dir: PathBuf::new(),
            tar: "tar".to_string(),
            pies: "pies".to_string(),
            pies_config_file: PathBuf::new(),
            component_template: DEFAULT_COMPONENT_TEMPLATE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verifier {
    DirExists,
    Exe,
    PiesVersion,
    PiesConfig,
    ComponentTemplate,
}

/// Per-field descriptor driving the loader defaults, the verifier and the
/// annotated writer.
pub struct FieldMeta {
    pub name: &'static str,
    pub comment: &'static str,
    pub verifier: Option<Verifier>,
    pub relative_to_root: bool,
}

pub const FIELDS: &[FieldMeta] = &[
    FieldMeta {
        name: "root_dir",
        comment: "Root directory",
        verifier: Some(Verifier::DirExists),
        relative_to_root: false,
    },
    FieldMeta {
        name: "runners_dir",
        comment: "Directory for storing runners",
        verifier: Some(Verifier::DirExists),
        relative_to_root: true,
    },
    FieldMeta {
        name: "cache_dir",
        comment: "Cache directory",
        verifier: Some(Verifier::DirExists),
        relative_to_root: true,
    },
    FieldMeta {
        name: "tar",
        comment: "Tar binary",
        verifier: Some(Verifier::Exe),
        relative_to_root: false,
    },
    FieldMeta {
        name: "pies",
        comment: "Pies binary",
        verifier: Some(Verifier::PiesVersion),
        relative_to_root: false,
    },
    FieldMeta {
        name: "pies_config_file",
        comment: "Pies configuration file name",
        verifier: Some(Verifier::PiesConfig),
        relative_to_root: true,
    },
    FieldMeta {
        name: "component_template",
        comment: "Template for runner components",
        verifier: Some(Verifier::ComponentTemplate),
        relative_to_root: false,
    },
];

pub fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"))
}

/// Path of the user config file and whether it was named explicitly through
/// `GHB_CONFIG` (an explicit file is required to exist, the default is not).
pub fn config_path() -> (PathBuf, bool) {
    match std::env::var("GHB_CONFIG") {
        Ok(p) if !p.is_empty() => (PathBuf::from(p), true),
        _ => (home_dir().join("ghb.conf"), false),
    }
}

/// Load the user config, fill in defaults and resolve relative paths.
/// Returns the config and the file it came from, if any.
pub fn load() -> Result<(Config, Option<PathBuf>)> {
    let (path, explicit) = config_path();
    let mut cfg = Config::default();
    let mut source = None;
    match fs::read_to_string(&path) {
        Ok(text) => {
            cfg = serde_yaml::from_str(&text).map_err(|e| Error::Yaml(path.clone(), e))?;
            source = Some(path);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {}
        Err(e) => {
            return Err(Error::Other(format!("can't read {}: {}", path.display(), e)));
        }
    }
    cfg.resolve();
    Ok((cfg, source))
}

fn resolve_under(path: &mut PathBuf, default: &str, root: &Path) {
    if path.as_os_str().is_empty() {
        *path = PathBuf::from(default);
    }
    if path.is_relative() {
        *path = root.join(&*path);
    }
}

impl Config {
    /// Provide missing defaults and resolve relative paths against the root
    /// directory (which itself defaults under the user's home).
    pub fn resolve(&mut self) {
        if self.root_dir.as_os_str().is_empty() {
            self.root_dir = PathBuf::from("GHB");
        }
        if self.root_dir.is_relative() {
            self.root_dir = home_dir().join(&self.root_dir);
        }
        let root = self.root_dir.clone();
        resolve_under(&mut self.runners_dir, "runners", &root);
        resolve_under(&mut self.cache_dir, "cache", &root);
        resolve_under(&mut self.pies_config_file, "pies.conf", &root);
    }

    /// Value of a field by its YAML name.
    pub fn field_value(&self, name: &str) -> Option<String> {
        match name {
            "root_dir" => Some(self.root_dir.display().to_string()),
            "runners_dir" => Some(self.runners_dir.display().to_string()),
            "cache_dir" => Some(self.cache_dir.display().to_string()),
            "tar" => Some(self.tar.clone()),
            "pies" => Some(self.pies.clone()),
            "pies_config_file" => Some(self.pies_config_file.display().to_string()),
            "component_template" => Some(self.component_template.clone()),
            _ => None,
        }
    }

    /// Run every field verifier; returns whether all of them passed.
    pub fn verify(&self, verbose: bool) -> bool {
        let mut ok = true;
        if verbose {
            println!("Verifying configuration");
        }
        for f in FIELDS {
            let Some(verifier) = f.verifier else { continue };
            let value = self
                .field_value(f.name)
                .expect("metadata table names a real field");
            if verbose {
                print!("  {} = {:?}: ", f.name, value);
                let _ = std::io::stdout().flush();
            }
            match self.run_verifier(verifier, &value) {
                Ok(()) => {
                    if verbose {
                        println!("OK");
                    }
                }
                Err(e) => {
                    if verbose {
                        println!("{}", e);
                    }
                    ok = false;
                }
            }
        }
        ok
    }

    fn run_verifier(&self, verifier: Verifier, value: &str) -> Result<()> {
        match verifier {
            Verifier::DirExists => {
                let meta = fs::metadata(value)
                    .map_err(|e| Error::Other(format!("can't stat {}: {}", value, e)))?;
                if !meta.is_dir() {
                    return Err(Error::Config(format!(
                        "{} exists, but is not a directory",
                        value
                    )));
                }
                Ok(())
            }
            Verifier::Exe => {
                let status = Command::new(value)
                    .arg("--version")
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .map_err(|e| Error::Other(format!("can't run {}: {}", value, e)))?;
                if !status.success() {
                    return Err(Error::Child(format!("{} --version exited with {}", value, status)));
                }
                Ok(())
            }
            Verifier::PiesVersion => check_pies_version(value),
            Verifier::PiesConfig => {
                fs::metadata(value)
                    .map_err(|e| Error::Other(format!("can't stat {}: {}", value, e)))?;
                let status = Command::new(&self.pies)
                    .args(["--config-file", value, "--lint"])
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .map_err(|e| Error::Other(format!("can't run {}: {}", self.pies, e)))?;
                match status.code() {
                    Some(0) => Ok(()),
                    Some(78) => Err(Error::Config("syntax check failed".to_string())),
                    _ => Err(Error::Child(format!("{} --lint exited with {}", self.pies, status))),
                }
            }
            Verifier::ComponentTemplate => {
                expand_template(&self.component_template, "runner_0", self).map(drop)
            }
        }
    }

    /// A copy with root-relative paths re-expressed relative to the root
    /// directory, for a readable config file.
    pub fn normalized_for_write(&self) -> Config {
        let mut cfg = self.clone();
        for f in FIELDS {
            if !f.relative_to_root {
                continue;
            }
            let path = match f.name {
                "runners_dir" => &mut cfg.runners_dir,
                "cache_dir" => &mut cfg.cache_dir,
                "pies_config_file" => &mut cfg.pies_config_file,
                _ => continue,
            };
            if let Ok(rel) = path.strip_prefix(&self.root_dir) {
                *path = rel.to_path_buf();
            }
        }
        cfg
    }

    /// Emit the YAML rendition with one `# comment` line ahead of each
    /// field, per the metadata table.
    pub fn annotate<W: Write>(&self, w: &mut W) -> Result<()> {
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| Error::Yaml(PathBuf::from("<config>"), e))?;
        let mut lines: Vec<String> = yaml.lines().map(str::to_string).collect();
        for f in FIELDS {
            let prefix = format!("{}:", f.name);
            if let Some(i) = lines.iter().position(|l| l.starts_with(&prefix)) {
                lines.insert(i, format!("# {}", f.comment));
            }
        }
        writeln!(w, "{}", lines.join("\n"))?;
        Ok(())
    }

    /// Write the annotated config to a file, owner read/write only.
    pub fn write_annotated(&self, path: &Path) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .map_err(|e| Error::Other(format!("can't create {}: {}", path.display(), e)))?;
        self.normalized_for_write().annotate(&mut file)
    }

    /// Create the directory tree and stub out the pies configuration file if
    /// it does not exist yet.
    pub fn finalize(&self) -> Result<()> {
        check_dir(&self.root_dir)?;
        check_dir(&self.runners_dir)?;
        check_dir(&self.cache_dir)?;
        if !self.pies_config_file.exists() {
            create_file_from_stub(&self.pies_config_file, PIES_CONFIG_STUB, self)?;
        }
        Ok(())
    }
}

fn check_dir(dir: &Path) -> Result<()> {
    match fs::metadata(dir) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("Creating directory {}", dir.display());
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o750)
                .create(dir)
                .map_err(|e| Error::Other(format!("can't create directory {}: {}", dir.display(), e)))
        }
        Ok(meta) if !meta.is_dir() => Err(Error::Config(format!(
            "{} exists, but is not a directory",
            dir.display()
        ))),
        Ok(_) => Ok(()),
        Err(e) => Err(Error::Other(format!("can't stat {}: {}", dir.display(), e))),
    }
}

fn create_file_from_stub(path: &Path, stub: &str, cfg: &Config) -> Result<()> {
    println!("Creating file {}", path.display());
    let text = expand_template(stub, "", cfg)?;
    fs::write(path, text)
        .map_err(|e| Error::Other(format!("can't write file {}: {}", path.display(), e)))
}

/// Expand `{{ RunnerName }}`, `{{ Port }}` and `{{ Config.FIELD }}`
/// placeholders. An unknown placeholder is an error.
pub fn expand_template(text: &str, runner_name: &str, cfg: &Config) -> Result<String> {
    let mut unknown = None;
    let out = PLACEHOLDER_RX
        .replace_all(text, |caps: &regex::Captures| {
            let name = &caps[1];
            match template_value(name, runner_name, cfg) {
                Some(v) => v,
                None => {
                    unknown.get_or_insert_with(|| name.to_string());
                    String::new()
                }
            }
        })
        .into_owned();
    if let Some(name) = unknown {
        return Err(Error::Config(format!(
            "unknown template placeholder {{{{ {} }}}}",
            name
        )));
    }
    Ok(out)
}

fn template_value(name: &str, runner_name: &str, cfg: &Config) -> Option<String> {
    match name {
        "RunnerName" => Some(runner_name.to_string()),
        "Port" => Some(DEFAULT_PIES_PORT.to_string()),
        _ => name
            .strip_prefix("Config.")
            .and_then(|field| cfg.field_value(field)),
    }
}

/// Canonicalize a dotted version to three components for comparison.
fn canonical_version(v: &str) -> Result<semver::Version> {
    let mut v = v.to_string();
    let dots = v.bytes().filter(|&b| b == b'.').count();
    for _ in dots..2 {
        v.push_str(".0");
    }
    semver::Version::parse(&v).map_err(|e| Error::Config(format!("bad version {}: {}", v, e)))
}

/// Run `<exe> --version` and require a GNU Pies at least 1.7.92.
pub fn check_pies_version(exe: &str) -> Result<()> {
    let output = Command::new(exe)
        .arg("--version")
        .output()
        .map_err(|e| Error::Other(format!("can't run {}: {}", exe, e)))?;
    if !output.status.success() {
        return Err(Error::Child(format!(
            "{} --version exited with {}",
            exe, output.status
        )));
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let caps = PIES_VERSION_RX
        .captures(&text)
        .ok_or_else(|| Error::Config("can't determine GNU pies version".to_string()))?;
    let found = canonical_version(&caps[1])?;
    let min = canonical_version(PIES_VERSION_MIN)?;
    if found < min {
        return Err(Error::Config(format!("version too old: {}", &caps[1])));
    }
    Ok(())
}
