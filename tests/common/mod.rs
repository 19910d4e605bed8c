//! Common test utilities for ghb integration tests.
//!
//! `TestEnv` gives every test an isolated HOME and config file so nothing
//! touches the user's real `~/ghb.conf` or GHB tree. `FixtureServer` is a
//! minimal canned-response HTTP server for exercising the GitHub client
//! without the network.

#![allow(dead_code)]

use std::fs;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;

use assert_cmd::Command;
pub use tempfile::TempDir;

pub struct TestEnv {
    pub home: TempDir,
}

impl TestEnv {
    /// Create an isolated environment with a ghb.conf rooted in a temp dir.
    pub fn new() -> Self {
        let env = TestEnv {
            home: TempDir::new().unwrap(),
        };
        let root = env.root_dir();
        fs::write(
            env.home.path().join("ghb.conf"),
            format!("root_dir: {}\n", root.display()),
        )
        .unwrap();
        env
    }

    pub fn root_dir(&self) -> PathBuf {
        self.home.path().join("GHB")
    }

    pub fn runners_dir(&self) -> PathBuf {
        self.root_dir().join("runners")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root_dir().join("cache")
    }

    pub fn pies_conf(&self) -> PathBuf {
        self.root_dir().join("pies.conf")
    }

    /// Write the pies configuration file, creating the GHB tree as needed.
    pub fn write_pies_conf(&self, text: &str) {
        fs::create_dir_all(self.root_dir()).unwrap();
        fs::write(self.pies_conf(), text).unwrap();
    }

    /// A Command for the ghb binary with HOME and GHB_CONFIG isolated.
    pub fn ghb(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_ghb"));
        cmd.env("HOME", self.home.path());
        cmd.env("GHB_CONFIG", self.home.path().join("ghb.conf"));
        cmd.env_remove("GHB_API_BASE");
        cmd
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// One canned response, matched on method and exact path.
#[derive(Clone)]
pub struct Route {
    pub method: &'static str,
    pub path: String,
    pub status: u16,
    pub body: Vec<u8>,
}

impl Route {
    pub fn json(method: &'static str, path: impl Into<String>, status: u16, body: &str) -> Self {
        Route {
            method,
            path: path.into(),
            status,
            body: body.as_bytes().to_vec(),
        }
    }
}

/// A fixture HTTP server answering canned responses and recording the
/// request heads it saw. Bind first so routes can reference `base()`, then
/// `start` the accept loop.
pub struct FixtureServer {
    base: String,
    listener: Option<TcpListener>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl FixtureServer {
    pub fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://127.0.0.1:{}", listener.local_addr().unwrap().port());
        FixtureServer {
            base,
            listener: Some(listener),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn start(&mut self, routes: Vec<Route>) {
        let listener = self.listener.take().expect("started once");
        let requests = Arc::clone(&self.requests);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let mut head = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                    if head.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let head = String::from_utf8_lossy(&head).to_string();
                let mut parts = head.split_whitespace();
                let method = parts.next().unwrap_or("").to_string();
                let path = parts.next().unwrap_or("").to_string();
                requests.lock().unwrap().push(head);

                let (status, body) = match routes
                    .iter()
                    .find(|r| r.method == method && r.path == path)
                {
                    Some(r) => (r.status, r.body.clone()),
                    None => (404, b"not found".to_vec()),
                };
                let response = format!(
                    "HTTP/1.1 {} X\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    status,
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
                let _ = stream.write_all(&body);
            }
        });
    }

    /// Request heads seen so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}
