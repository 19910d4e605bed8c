//! Client for the pies control socket.
//!
//! The control URL comes from the `control { socket URL; }` block of the
//! pies configuration. `local://`, `file://` and `unix://` URLs name a
//! UNIX-domain socket path; `inet://` names a TCP endpoint, with a
//! `0.0.0.0` (or empty) host rewritten to `127.0.0.1` for dialling. All
//! verbs carry empty request bodies and all responses are JSON, so one
//! minimal HTTP/1.1 exchange per request is enough.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::{Error, Result};

#[derive(Debug, Deserialize)]
pub struct CtlResponse {
    #[serde(alias = "Status", default)]
    pub status: String,
    #[serde(alias = "Message", default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct InstanceInfo {
    #[serde(rename = "PID")]
    pub pid: i64,
    #[serde(default)]
    pub argv: Vec<String>,
    #[serde(default)]
    pub binary: String,
    #[serde(rename = "instance", default)]
    pub instance_name: String,
    #[serde(rename = "package", default)]
    pub package_name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Deserialize)]
pub struct ComponentInfo {
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub status: String,
    #[serde(rename = "PID", default)]
    pub pid: i64,
    #[serde(default)]
    pub argv: Vec<String>,
    #[serde(default)]
    pub command: String,
}

/// Where a control URL actually dials.
#[derive(Debug, PartialEq, Eq)]
pub enum DialTarget {
    Unix(PathBuf),
    Tcp(String),
}

/// Resolve a control URL to its dial target.
pub fn dial_target(url: &Url) -> Result<DialTarget> {
    match url.scheme() {
        "local" | "file" | "unix" => Ok(DialTarget::Unix(PathBuf::from(url.path()))),
        "inet" => {
            let host = match url.host_str() {
                None | Some("") | Some("0.0.0.0") => "127.0.0.1",
                Some(h) => h,
            };
            let port = url
                .port()
                .ok_or_else(|| Error::Transport(format!("no port in control URL {}", url)))?;
            Ok(DialTarget::Tcp(format!("{}:{}", host, port)))
        }
        scheme => Err(Error::Transport(format!(
            "control URL scheme {} not implemented",
            scheme
        ))),
    }
}

pub struct CtlClient {
    url: Url,
}

impl CtlClient {
    pub fn new(url: &Url) -> Self {
        CtlClient { url: url.clone() }
    }

    /// Reload the runtime configuration.
    pub fn reload(&self) -> Result<()> {
        self.expect_ok("PUT", "/conf/runtime")
    }

    /// Stop the supervisor instance.
    pub fn stop(&self) -> Result<()> {
        self.expect_ok("DELETE", "/instance/PID")
    }

    /// Restart the supervisor instance.
    pub fn restart(&self) -> Result<()> {
        self.expect_ok("PUT", "/instance/PID")
    }

    pub fn instance_info(&self) -> Result<InstanceInfo> {
        self.request("GET", "/instance")
    }

    pub fn components(&self) -> Result<Vec<ComponentInfo>> {
        self.request("GET", "/programs")
    }

    fn expect_ok(&self, method: &str, path: &str) -> Result<()> {
        let resp: CtlResponse = self.request(method, path)?;
        if resp.status != "OK" {
            return Err(Error::Remote(resp.message));
        }
        Ok(())
    }

    /// The Host header is the URL host for `inet`, else the literal
    /// `localhost`.
    fn host_header(&self) -> String {
        if self.url.scheme() == "inet" {
            match (self.url.host_str(), self.url.port()) {
                (Some(h), Some(p)) if !h.is_empty() => format!("{}:{}", h, p),
                (Some(h), None) if !h.is_empty() => h.to_string(),
                _ => "localhost".to_string(),
            }
        } else {
            "localhost".to_string()
        }
    }

    fn request<T: DeserializeOwned>(&self, method: &str, path: &str) -> Result<T> {
        debug!("{} {} via {}", method, path, self.url);
        let host = self.host_header();
        let (status, body) = match dial_target(&self.url)? {
            DialTarget::Unix(p) => {
                let stream = UnixStream::connect(&p).map_err(dial_error)?;
                exchange(stream, method, path, &host)?
            }
            DialTarget::Tcp(addr) => {
                let stream = TcpStream::connect(&addr).map_err(dial_error)?;
                exchange(stream, method, path, &host)?
            }
        };
        serde_json::from_slice(&body).map_err(|e| {
            if status >= 400 {
                Error::Remote(format!("pies control request failed: HTTP {}", status))
            } else {
                Error::Transport(format!("can't parse pies response: {}", e))
            }
        })
    }
}

/// Connection refused (or a missing socket path) means the supervisor is not
/// running; that is an expected state, not a transport failure.
fn dial_error(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotFound => Error::NotRunning,
        _ => Error::Transport(format!("can't query: {}", e)),
    }
}

/// One HTTP/1.1 request/response over an already-connected stream. Returns
/// the status code and the response body.
fn exchange<S: Read + Write>(
    mut stream: S,
    method: &str,
    path: &str,
    host: &str,
) -> Result<(u16, Vec<u8>)> {
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        method, path, host
    );
    stream
        .write_all(request.as_bytes())
        .map_err(|e| Error::Transport(format!("can't query: {}", e)))?;

    let mut raw = Vec::new();
    stream
        .read_to_end(&mut raw)
        .map_err(|e| Error::Transport(format!("can't read response: {}", e)))?;

    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| Error::Transport("response missing header delimiter".to_string()))?;
    let head = String::from_utf8_lossy(&raw[..split]);
    let status = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| Error::Transport("response has invalid status line".to_string()))?;

    Ok((status, raw[split + 4..].to_vec()))
}
