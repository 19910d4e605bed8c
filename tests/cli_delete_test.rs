//! Integration tests for `ghb delete` file surgery.
//!
//! `--keep` skips deregistration and directory removal, so these tests
//! exercise the token-splice and save path without a GitHub fixture.

mod common;

use std::fs;

use common::TestEnv;
use predicates::prelude::*;

const PIES_CONF: &str = r#"# hand-written preamble, must survive
pidfile /tmp/pies.pid;

control {
	socket "inet://127.0.0.1:1";
}

component web_0 {
	mode respawn;
	chdir "/srv/runners/web_0";
	command "./run.sh";
}

/* block comment between components */

component web_1 {
	mode respawn;
	chdir "/srv/runners/web_1";
	command "./run.sh";
}
"#;

#[test]
fn delete_keep_splices_the_last_runner() {
    let env = TestEnv::new();
    env.write_pies_conf(PIES_CONF);

    env.ghb()
        .args(["delete", "--org", "acme", "web", "--keep"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removing runner web_1"));

    let text = fs::read_to_string(env.pies_conf()).unwrap();
    assert!(text.contains("# hand-written preamble, must survive"));
    assert!(text.contains("/* block comment between components */"));
    assert!(text.contains("web_0"));
    assert!(!text.contains("web_1"));
}

#[test]
fn delete_keep_by_number_splices_that_runner() {
    let env = TestEnv::new();
    env.write_pies_conf(PIES_CONF);

    env.ghb()
        .args(["delete", "--org", "acme", "web", "0", "--keep"])
        .assert()
        .success();

    let text = fs::read_to_string(env.pies_conf()).unwrap();
    assert!(!text.contains("web_0"));
    assert!(text.contains("web_1"));
}

#[test]
fn delete_unknown_project_fails() {
    let env = TestEnv::new();
    env.write_pies_conf(PIES_CONF);

    env.ghb()
        .args(["delete", "--org", "acme", "mail", "--keep"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("found no runners for mail"));
}

#[test]
fn delete_unknown_number_fails() {
    let env = TestEnv::new();
    env.write_pies_conf(PIES_CONF);

    env.ghb()
        .args(["delete", "--org", "acme", "web", "7", "--keep"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("web: no runner 7"));
}

#[test]
fn delete_warns_when_pies_is_not_reloaded() {
    let env = TestEnv::new();
    env.write_pies_conf(PIES_CONF);

    // the control socket points at a closed port, so the reload is reported
    // as skipped but the deletion itself sticks
    env.ghb()
        .args(["delete", "--org", "acme", "web", "--keep"])
        .assert()
        .success()
        .stderr(predicate::str::contains("pies not reloaded"));
}

#[test]
fn repeated_delete_empties_the_project() {
    let env = TestEnv::new();
    env.write_pies_conf(PIES_CONF);

    for _ in 0..2 {
        env.ghb()
            .args(["delete", "--org", "acme", "web", "--keep"])
            .assert()
            .success();
    }

    env.ghb()
        .args(["delete", "--org", "acme", "web", "--keep"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("found no runners for web"));

    let text = fs::read_to_string(env.pies_conf()).unwrap();
    assert!(!text.contains("component web"));
    assert!(text.contains("control {"));
}
