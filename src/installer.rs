//! Download, extract, register and tear down runner installations.
//!
//! A runner is a directory under the runners dir holding an extracted
//! upstream archive; the archive's own `config.sh` registers it with GitHub
//! and deregisters it on removal. Child processes inherit stdio so the
//! runner scripts can talk to the operator, and they run with their working
//! directory set per invocation; the ghb process itself never changes
//! directory.

use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::Config;
use crate::github::{Entity, GitHub};
use crate::{Error, Result};

fn hostname() -> Result<String> {
    let name = nix::unistd::gethostname()
        .map_err(|e| Error::Other(format!("can't determine hostname: {}", e)))?;
    Ok(name.to_string_lossy().into_owned())
}

/// Extract an archive into `<runners_dir>/<runner_name>` and register the
/// runner with GitHub through the archive's `config.sh`.
pub fn install(
    cfg: &Config,
    archive: &Path,
    runner_name: &str,
    project_url: &str,
    token: &str,
    labels: Option<&str>,
) -> Result<()> {
    let dir = cfg.runners_dir.join(runner_name);
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o750)
        .create(&dir)
        .map_err(|e| Error::Other(format!("can't create {}: {}", dir.display(), e)))?;

    println!("Extracting to {}", dir.display());
    let status = Command::new(&cfg.tar)
        .arg("-C")
        .arg(&dir)
        .args(["-x", "-f"])
        .arg(archive)
        .status()
        .map_err(|e| Error::Other(format!("error running {}: {}", cfg.tar, e)))?;
    if !status.success() {
        return Err(Error::Child(format!("{} exited with {}", cfg.tar, status)));
    }

    let name = format!("{}_{}", hostname()?, runner_name);
    println!("Configuring {}", name);
    let mut cmd = Command::new("./config.sh");
    cmd.current_dir(&dir).args([
        "--name",
        &name,
        "--url",
        project_url,
        "--token",
        token,
        "--unattended",
    ]);
    if let Some(labels) = labels {
        cmd.args(["--labels", labels]);
    }
    let status = cmd
        .status()
        .map_err(|e| Error::Other(format!("error running config.sh: {}", e)))?;
    if !status.success() {
        return Err(Error::Child(format!("config.sh exited with {}", status)));
    }
    Ok(())
}

/// Deregister a runner from GitHub by running `config.sh remove` in its
/// directory. An empty token skips the call.
pub fn deregister(dir: &Path, runner_name: &str, token: &str) -> Result<()> {
    if token.is_empty() {
        return Ok(());
    }
    let status = Command::new("./config.sh")
        .current_dir(dir)
        .args(["remove", "--token", token])
        .status()
        .map_err(|e| Error::Other(format!("error removing {}: {}", runner_name, e)))?;
    if !status.success() {
        return Err(Error::Child(format!(
            "error removing {}: config.sh exited with {}",
            runner_name, status
        )));
    }
    Ok(())
}

/// Remove a runner's directory tree.
pub fn remove_tree(dir: &Path) -> Result<()> {
    fs::remove_dir_all(dir)
        .map_err(|e| Error::Other(format!("failed to remove {}: {}", dir.display(), e)))
}

/// Locate the runner archive for the running platform, downloading it into
/// the cache directory unless a cached copy already exists.
pub fn get_archive(cfg: &Config, gh: &GitHub, entity: &Entity) -> Result<PathBuf> {
    let dn = gh.select_download(entity)?;
    let filename = cfg.cache_dir.join(&dn.filename);
    if filename.exists() {
        println!("Using cached copy {}", filename.display());
        return Ok(filename);
    }
    println!("Downloading {}", dn.url);
    gh.download_file(&dn.url, &filename, dn.sha256.as_deref())?;
    Ok(filename)
}
