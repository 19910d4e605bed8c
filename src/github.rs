//! GitHub REST client for runner registration tokens and archive downloads.
//!
//! Short-lived registration/removal tokens are minted with a long-lived PAT
//! and cached in the token store; the two-tier lookup in
//! [`GitHub::get_token`] falls back from an issued-token key to the PAT that
//! can mint it.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::tokens::{GhToken, TokenStore};
use crate::{Error, Result};

/// GitHub API base URL; overridable through `GHB_API_BASE`.
pub const GITHUB_API_BASE: &str = "https://api.github.com";

/// User-Agent header required by the GitHub API.
const USER_AGENT: &str = "ghb";

pub const REGISTRATION_TOKEN: &str = "registration-token";
pub const REMOVE_TOKEN: &str = "remove-token";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Enterprise,
    Org,
    Repo,
}

impl EntityKind {
    fn prefix(self) -> &'static str {
        match self {
            EntityKind::Enterprise => "/enterprises/",
            EntityKind::Org => "/orgs/",
            EntityKind::Repo => "/repos/",
        }
    }
}

/// A GitHub scope under which runner tokens are minted. For repositories the
/// canonical name is `owner/project`.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub kind: EntityKind,
    pub name: String,
}

impl Entity {
    pub fn new(kind: EntityKind, name: impl Into<String>) -> Self {
        Entity {
            kind,
            name: name.into(),
        }
    }

    /// Key prefix of the entity itself: `/orgs/NAME`, `/enterprises/NAME` or
    /// `/repos/OWNER/REPO`.
    pub fn base_key(&self) -> String {
        format!("{}{}", self.kind.prefix(), self.name)
    }

    /// Key under which the entity's PAT is stored. For a repository this uses
    /// only the owner, not `OWNER/REPO`.
    pub fn pat_key(&self) -> String {
        match self.name.find('/') {
            Some(n) => format!("{}{}", self.kind.prefix(), &self.name[..n]),
            None => self.base_key(),
        }
    }

    /// Cache key for an issued token of the given kind
    /// ([`REGISTRATION_TOKEN`] or [`REMOVE_TOKEN`]). The key doubles as the
    /// API path that mints the token.
    pub fn token_key(&self, kind: &str, project: &str) -> String {
        if self.kind == EntityKind::Repo {
            format!("{}/actions/runners/{}", self.base_key(), kind)
        } else {
            format!("{}/{}/actions/runners/{}", self.base_key(), project, kind)
        }
    }

    /// URL the runner registers against.
    pub fn project_url(&self, project: &str) -> String {
        if self.kind == EntityKind::Repo {
            format!("https://github.com/{}", self.name)
        } else {
            format!("https://github.com/{}/{}", self.name, project)
        }
    }
}

/// Derive the PAT key able to mint tokens for `key` by truncating after the
/// entity-type prefix and the first path segment. The second element is true
/// when `key` is itself a PAT key. Keys outside the entity key space yield
/// `None`.
pub fn pat_key_for(key: &str) -> Option<(String, bool)> {
    for kind in [EntityKind::Enterprise, EntityKind::Org, EntityKind::Repo] {
        let pfx = kind.prefix();
        if let Some(rest) = key.strip_prefix(pfx) {
            return Some(match rest.find('/') {
                None => (key.to_string(), true),
                Some(n) => (format!("{}{}", pfx, &rest[..n]), false),
            });
        }
    }
    None
}

/// One entry of the runner-application downloads listing.
#[derive(Debug, Clone, Deserialize)]
pub struct Download {
    pub os: String,
    #[serde(rename = "architecture")]
    pub arch: String,
    #[serde(rename = "download_url")]
    pub url: String,
    pub filename: String,
    #[serde(rename = "sha256_checksum", default)]
    pub sha256: Option<String>,
}

/// The architecture string GitHub uses for the running platform.
pub fn runner_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        other => other,
    }
}

/// First download matching an `(os, arch)` pair.
pub fn match_download(downloads: Vec<Download>, os: &str, arch: &str) -> Option<Download> {
    downloads.into_iter().find(|d| d.os == os && d.arch == arch)
}

pub struct GitHub<'a> {
    store: &'a TokenStore,
    base: String,
}

impl<'a> GitHub<'a> {
    pub fn new(store: &'a TokenStore) -> Self {
        let base =
            std::env::var("GHB_API_BASE").unwrap_or_else(|_| GITHUB_API_BASE.to_string());
        Self::with_base(store, base)
    }

    /// Client against an explicit API base; `new` resolves the base from the
    /// environment.
    pub fn with_base(store: &'a TokenStore, base: impl Into<String>) -> Self {
        GitHub {
            store,
            base: base.into(),
        }
    }

    fn request(&self, method: &str, path: &str, pat: &str) -> ureq::Request {
        ureq::request(method, &format!("{}{}", self.base, path))
            .set("Accept", "application/vnd.github+json")
            .set("Authorization", &format!("token {}", pat))
            .set("User-Agent", USER_AGENT)
    }

    /// Mint a fresh token for an issued-token key. Anything but HTTP 201
    /// reads as "no token to be had".
    fn mint(&self, key: &str, pat: &str) -> Result<GhToken> {
        println!("Getting token for {}{}", self.base, key);
        match self.request("POST", key, pat).call() {
            Ok(resp) if resp.status() == 201 => Ok(resp.into_json()?),
            Ok(_) | Err(ureq::Error::Status(_, _)) => Err(Error::TokenNotFound),
            Err(e) => Err(Error::Transport(e.to_string())),
        }
    }

    /// Two-tier token resolution: the cache first, then a fresh mint with the
    /// entity's PAT. A PAT key that misses the cache is never minted.
    pub fn get_token(&self, key: &str) -> Result<String> {
        match self.store.fetch(key) {
            Ok(token) => Ok(token),
            Err(Error::TokenNotFound) => {
                let (pat_key, is_pat) = pat_key_for(key).ok_or(Error::TokenNotFound)?;
                if is_pat {
                    return Err(Error::TokenNotFound);
                }
                let pat = self.store.fetch(&pat_key)?;
                let tok = self.mint(key, &pat)?;
                self.store.save(key, &tok)?;
                Ok(tok.token)
            }
            Err(e) => Err(e),
        }
    }

    /// The runner-application downloads available for an entity.
    pub fn downloads(&self, entity: &Entity) -> Result<Vec<Download>> {
        let pat = self.store.fetch(&entity.pat_key())?;
        let path = format!("{}/actions/runners/downloads", entity.base_key());
        match self.request("GET", &path, &pat).call() {
            Ok(resp) => Ok(resp.into_json()?),
            Err(ureq::Error::Status(code, resp)) => Err(Error::Remote(format!(
                "{} {}",
                code,
                resp.status_text()
            ))),
            Err(e) => Err(Error::Transport(e.to_string())),
        }
    }

    /// The download matching the running platform.
    pub fn select_download(&self, entity: &Entity) -> Result<Download> {
        let os = std::env::consts::OS;
        let arch = runner_arch();
        println!("Looking for runner tarball for {} {}", os, arch);
        let downloads = self.downloads(entity)?;
        match_download(downloads, os, arch)
            .ok_or_else(|| Error::NotFound(format!("no runner download for {} {}", os, arch)))
    }

    /// Download a URL to a file. A failed or truncated transfer, or a
    /// checksum mismatch, removes the partial file.
    pub fn download_file(&self, url: &str, dest: &Path, sha256: Option<&str>) -> Result<()> {
        debug!("GET {}", url);
        let resp = match ureq::get(url).set("User-Agent", USER_AGENT).call() {
            Ok(resp) => resp,
            Err(ureq::Error::Status(code, resp)) => {
                return Err(Error::Remote(format!(
                    "bad status: {} {}",
                    code,
                    resp.status_text()
                )));
            }
            Err(e) => return Err(Error::Transport(e.to_string())),
        };

        let mut reader = resp.into_reader();
        let mut file = File::create(dest)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    drop(file);
                    let _ = std::fs::remove_file(dest);
                    return Err(e.into());
                }
            };
            hasher.update(&buf[..n]);
            if let Err(e) = file.write_all(&buf[..n]) {
                drop(file);
                let _ = std::fs::remove_file(dest);
                return Err(e.into());
            }
        }
        drop(file);

        if let Some(want) = sha256 {
            let got = format!("{:x}", hasher.finalize());
            if !got.eq_ignore_ascii_case(want) {
                let _ = std::fs::remove_file(dest);
                return Err(Error::Remote(format!(
                    "checksum mismatch for {}: expected {}, got {}",
                    dest.display(),
                    want,
                    got
                )));
            }
        }
        Ok(())
    }
}
