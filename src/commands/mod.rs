//! Command implementations for the ghb CLI.
//!
//! Each function is one top-level action. The user config is loaded once in
//! `main` and threaded through; nothing below this layer touches process
//! globals. Mutating commands order their side effects so that GitHub
//! registration state changes first, the pies configuration file second and
//! the running supervisor last: a failed reload after a successful save is
//! reported but leaves the system consistent on disk.

use std::path::Path;
use std::process::Command;

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};

use crate::config::{self, Config};
use crate::github::{Entity, EntityKind, GitHub, REGISTRATION_TOKEN, REMOVE_TOKEN};
use crate::installer;
use crate::piesconf::{self, PiesConfig};
use crate::piesctl::CtlClient;
use crate::tokens::{GhToken, TokenStore};
use crate::{Error, Result};

/// Ask the supervisor to reload its configuration. The file is already
/// saved, so a failure here leaves a consistent state behind and is only
/// reported; the next invocation observes the new configuration either way.
fn reload(pc: &PiesConfig) {
    let outcome = match &pc.control_url {
        Some(url) => CtlClient::new(url).reload(),
        None => Err(Error::Config(
            "no control URL in pies configuration".to_string(),
        )),
    };
    if let Err(e) = outcome {
        eprintln!("ghb: pies configuration updated, but pies not reloaded: {}", e);
    }
}

fn control_url(pc: &PiesConfig) -> Result<&url::Url> {
    pc.control_url
        .as_ref()
        .ok_or_else(|| Error::Config("no control URL in pies configuration".to_string()))
}

fn pies_start(cfg: &Config) -> Result<()> {
    println!("Starting GNU pies");
    let status = Command::new(&cfg.pies)
        .arg("--config-file")
        .arg(&cfg.pies_config_file)
        .status()
        .map_err(|e| Error::Other(format!("can't start {}: {}", cfg.pies, e)))?;
    if !status.success() {
        return Err(Error::Child(format!(
            "can't start {}: exited with {}",
            cfg.pies, status
        )));
    }
    Ok(())
}

/// Settle the project name and the canonical entity for `add`. A repository
/// entity is stored as `owner/project`; a bare owner is completed from the
/// project, and a slug that disagrees with the positional PROJECT is
/// rejected.
fn resolve_project(
    mut entity: Entity,
    project: Option<String>,
    url: Option<&str>,
) -> Result<(Entity, String)> {
    let missing = || {
        Error::Config("either --url or PROJECT must be given; try `--help' for assistance".to_string())
    };
    let url_basename = |u: &str| -> String {
        u.trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(u)
            .to_string()
    };

    if entity.kind == EntityKind::Repo {
        match entity.name.clone().split_once('/') {
            Some((_, slug_project)) => match &project {
                None => return Ok((entity, slug_project.to_string())),
                Some(p) if p == slug_project => return Ok((entity, slug_project.to_string())),
                Some(_) => {
                    return Err(Error::Config(
                        "repository suffix doesn't match project name".to_string(),
                    ));
                }
            },
            None => {
                let project = match project {
                    Some(p) => p,
                    None => url.map(url_basename).ok_or_else(missing)?,
                };
                entity.name = format!("{}/{}", entity.name, project);
                return Ok((entity, project));
            }
        }
    }

    let project = match project {
        Some(p) => p,
        None => url.map(url_basename).ok_or_else(missing)?,
    };
    Ok((entity, project))
}

pub fn add(
    cfg: &Config,
    entity: Entity,
    project: Option<String>,
    url: Option<String>,
    token: Option<String>,
    labels: Option<String>,
) -> Result<()> {
    cfg.finalize()?;

    let (entity, project) = resolve_project(entity, project, url.as_deref())?;
    let project_url = url.unwrap_or_else(|| entity.project_url(&project));

    let store = TokenStore::new(&cfg.cache_dir);
    let gh = GitHub::new(&store);
    let token = match token {
        Some(t) => t,
        None => gh.get_token(&entity.token_key(REGISTRATION_TOKEN, &project))?,
    };

    let mut pc = piesconf::parse(&cfg.pies_config_file)?;
    let name = format!("{}_{}", project, pc.next_num(&project));

    let archive = installer::get_archive(cfg, &gh, &entity)?;
    installer::install(cfg, &archive, &name, &project_url, &token, labels.as_deref())?;

    pc.add_runner(config::expand_template(&cfg.component_template, &name, cfg)?);
    pc.save()?;
    reload(&pc);
    Ok(())
}

pub fn delete(
    cfg: &Config,
    mut entity: Entity,
    project: String,
    number: Option<u32>,
    keep: bool,
    force: bool,
    token: Option<String>,
) -> Result<()> {
    if entity.kind == EntityKind::Repo {
        match entity.name.clone().split_once('/') {
            Some((_, slug_project)) if slug_project != project => {
                return Err(Error::Config(
                    "repository suffix doesn't match project name".to_string(),
                ));
            }
            Some(_) => {}
            None => entity.name = format!("{}/{}", entity.name, project),
        }
    }

    let store = TokenStore::new(&cfg.cache_dir);
    let gh = GitHub::new(&store);
    let token = match token {
        Some(t) => t,
        None if !keep => gh.get_token(&entity.token_key(REMOVE_TOKEN, &project))?,
        None => String::new(),
    };

    let mut pc = piesconf::parse(&cfg.pies_config_file)?;
    let runners = pc
        .runners
        .get(&project)
        .ok_or_else(|| Error::NotFound(format!("found no runners for {}", project)))?;

    let runner = match number {
        None => {
            let r = runners.last().expect("catalogued projects are non-empty");
            println!("Removing runner {}_{}", project, r.num);
            r.clone()
        }
        Some(n) => {
            let i = runners
                .binary_search_by_key(&n, |r| r.num)
                .map_err(|_| Error::NotFound(format!("{}: no runner {}", project, n)))?;
            runners[i].clone()
        }
    };

    // Deregistration first, then the config file, then the reload; the
    // directory tree goes last so a failure leaves it inspectable.
    let name = format!("{}_{}", project, runner.num);
    if !keep {
        if let Err(e) = installer::deregister(Path::new(&runner.dir), &name, &token) {
            if force {
                eprintln!("ghb: {}; continuing anyway", e);
            } else {
                return Err(e);
            }
        }
    }

    pc.delete_runner(&runner);
    pc.save()?;
    reload(&pc);

    if !keep {
        installer::remove_tree(Path::new(&runner.dir))?;
    }
    Ok(())
}

pub fn list(cfg: &Config, verbose: bool) -> Result<()> {
    let pc = piesconf::parse(&cfg.pies_config_file)?;
    for (project, runners) in &pc.runners {
        let last = runners.last().expect("catalogued projects are non-empty");
        println!("{:<32.32} {:>4} {}", project, runners.len(), last.num + 1);
        if verbose {
            for r in runners {
                println!(
                    " {}: {} {} - {}",
                    r.num, r.dir, pc.tokens[r.token_start].locus, pc.tokens[r.token_end].locus
                );
            }
        }
    }
    Ok(())
}

fn report_config_source(source: Option<&Path>) {
    match source {
        Some(file) => println!("Using configuration file {}", file.display()),
        None => println!("Using built-in configuration defaults"),
    }
}

pub fn status(cfg: &Config, source: Option<&Path>, verbose: bool) -> Result<()> {
    report_config_source(source);

    if !cfg.verify(verbose) {
        return Err(Error::Config(
            "configuration fails verification; run `ghb configcheck' for details".to_string(),
        ));
    }
    println!("Configuration file passed syntax check");

    let pc = piesconf::parse(&cfg.pies_config_file)?;
    let ctl = CtlClient::new(control_url(&pc)?);
    match ctl.instance_info() {
        Ok(info) => println!(
            "{} {} running with PID {}",
            info.package_name, info.version, info.pid
        ),
        Err(e) => println!("{}", e),
    }

    if let Ok(components) = ctl.components() {
        match components.len() {
            0 => println!("No runners active"),
            n => println!("{} runners active", n),
        }
    }
    Ok(())
}

pub fn configcheck(cfg: &Config, source: Option<&Path>, list: bool) -> Result<()> {
    report_config_source(source);
    if list {
        cfg.annotate(&mut std::io::stdout())?;
    }
    if !cfg.verify(true) {
        return Err(Error::Config(
            "configuration fails verification".to_string(),
        ));
    }
    Ok(())
}

pub fn start(cfg: &Config) -> Result<()> {
    if !cfg.verify(false) {
        return Err(Error::Config(
            "configuration fails sanity checking; run `ghb configcheck' for more info".to_string(),
        ));
    }
    let pc = piesconf::parse(&cfg.pies_config_file)?;
    if let Some(url) = &pc.control_url
        && CtlClient::new(url).instance_info().is_ok()
    {
        return Err(Error::Config(
            "GNU pies supervisor is running; run `ghb status' for more info".to_string(),
        ));
    }
    pies_start(cfg)
}

pub fn stop(cfg: &Config) -> Result<()> {
    let pc = piesconf::parse(&cfg.pies_config_file)?;
    let ctl = CtlClient::new(control_url(&pc)?);
    if ctl.instance_info().is_err() {
        return Err(Error::NotFound("No running pies instance found".to_string()));
    }
    ctl.stop()?;
    println!("GNU pies stopped");
    Ok(())
}

pub fn restart(cfg: &Config) -> Result<()> {
    let pc = piesconf::parse(&cfg.pies_config_file)?;
    if let Some(url) = &pc.control_url {
        let ctl = CtlClient::new(url);
        if ctl.instance_info().is_ok() {
            ctl.restart()?;
            println!("GNU pies restarted");
            return Ok(());
        }
    }
    pies_start(cfg)
}

pub fn setup(cfg: &Config, user: &str) -> Result<()> {
    if cfg.verify(false) {
        if let Ok(pc) = piesconf::parse(&cfg.pies_config_file)
            && let Some(url) = &pc.control_url
            && let Ok(info) = CtlClient::new(url).instance_info()
        {
            println!(
                "{} {} running with PID {}",
                info.package_name, info.version, info.pid
            );
        }
        return Err(Error::Config("ghb appears to be set up already".to_string()));
    }

    cfg.finalize()?;
    if !cfg.verify(false) {
        return Err(Error::Config(
            "configuration fails sanity checking; run `ghb configcheck' for more info".to_string(),
        ));
    }

    let (path, _) = config::config_path();
    cfg.write_annotated(&path)?;

    pies_start(cfg)?;
    println!(
        "Setup finished.  Store a PAT with `ghb pat --org {} --set TOKEN', then run `ghb add' to add runners.",
        user
    );
    Ok(())
}

fn parse_expiry(value: &str) -> Result<DateTime<Utc>> {
    if let Some(rest) = value.strip_prefix('+') {
        let dur = humantime::parse_duration(rest)
            .map_err(|e| Error::Config(format!("bad expiration time {}: {}", value, e)))?;
        let delta = TimeDelta::from_std(dur)
            .map_err(|e| Error::Config(format!("bad expiration time {}: {}", value, e)))?;
        Ok(Utc::now() + delta)
    } else {
        let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
            .map_err(|e| Error::Config(format!("bad expiration time {}: {}", value, e)))?;
        Ok(naive.and_utc())
    }
}

fn print_token(tok: &GhToken) {
    println!("Token: {}", tok.token);
    if tok.is_expired() {
        println!("Expired (at: {})", tok.expires_at.to_rfc3339());
    } else {
        println!("Expires at: {}", tok.expires_at.to_rfc3339());
    }
}

pub fn pat(
    cfg: &Config,
    entity: Entity,
    set: Option<String>,
    expires: Option<String>,
    delete: bool,
    all: bool,
) -> Result<()> {
    let store = TokenStore::new(&cfg.cache_dir);
    let key = entity.pat_key();

    if delete {
        return store.delete(&key);
    }

    match set {
        Some(token) => {
            let expires_at = match expires {
                Some(v) => parse_expiry(&v)?,
                None => Utc::now() + TimeDelta::days(7),
            };
            store.save(&key, &GhToken { token, expires_at })
        }
        None => {
            let tok = store.fetch_raw(&key)?;
            print_token(&tok);
            if all {
                for (name, tok) in store.scan_prefix(&key)? {
                    println!("\nName: {}", name);
                    print_token(&tok);
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn org(name: &str) -> Entity {
        Entity::new(EntityKind::Org, name)
    }

    fn repo(name: &str) -> Entity {
        Entity::new(EntityKind::Repo, name)
    }

    #[test]
    fn project_from_positional_argument() {
        let (entity, project) = resolve_project(org("acme"), Some("web".into()), None).unwrap();
        assert_eq!(entity.name, "acme");
        assert_eq!(project, "web");
    }

    #[test]
    fn project_from_url_basename() {
        let (_, project) =
            resolve_project(org("acme"), None, Some("https://github.com/acme/web")).unwrap();
        assert_eq!(project, "web");
    }

    #[test]
    fn project_required_without_url() {
        assert!(resolve_project(org("acme"), None, None).is_err());
    }

    #[test]
    fn repo_slug_supplies_the_project() {
        let (entity, project) = resolve_project(repo("owner/web"), None, None).unwrap();
        assert_eq!(entity.name, "owner/web");
        assert_eq!(project, "web");
    }

    #[test]
    fn bare_repo_owner_is_completed() {
        let (entity, project) = resolve_project(repo("owner"), Some("web".into()), None).unwrap();
        assert_eq!(entity.name, "owner/web");
        assert_eq!(project, "web");
    }

    #[test]
    fn disagreeing_repo_slug_is_rejected() {
        assert!(resolve_project(repo("owner/web"), Some("other".into()), None).is_err());
    }

    #[test]
    fn expiry_accepts_absolute_and_relative_forms() {
        let abs = parse_expiry("2030-01-02 03:04:05").unwrap();
        assert_eq!(abs.to_rfc3339(), "2030-01-02T03:04:05+00:00");

        let rel = parse_expiry("+2h").unwrap();
        let delta = rel - Utc::now();
        assert!(delta > TimeDelta::minutes(119) && delta <= TimeDelta::minutes(121));

        assert!(parse_expiry("soon").is_err());
    }
}
