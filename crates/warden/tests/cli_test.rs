//! CLI integration tests for `warden`.
//!
//! These tests invoke the compiled `warden` binary as a subprocess and verify
//! its behavior end-to-end. Each test operates in an isolated temp directory
//! with `HOME` and `XDG_CONFIG_HOME` pointed into it, so no user config is
//! picked up.
//!
//! # Running
//!
//! ```bash
//! cargo test -p warden --test cli_test
//! ```

#![allow(clippy::unwrap_used)]

use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::time::{Duration, Instant, SystemTime};
use tempfile::TempDir;

// ============================================================================
// Infrastructure
// ============================================================================

/// Path to the compiled `warden` binary, injected by Cargo at compile time.
const WARDEN: &str = env!("CARGO_BIN_EXE_warden");

const SECRET_HEX: &str = "00112233445566778899aabbccddeeff";

fn command(cwd: &Path, args: &[&str]) -> Command {
    let mut cmd = Command::new(WARDEN);
    cmd.args(args)
        .current_dir(cwd)
        .env("HOME", cwd)
        .env("XDG_CONFIG_HOME", cwd.join(".config"))
        .env_remove("WARDEN_LOG"); // keep test output clean
    cmd
}

/// Invoke `warden` with the given arguments in `cwd` and return the full Output.
fn run_warden(cwd: &Path, args: &[&str]) -> Output {
    command(cwd, args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to spawn warden binary: {e}"))
}

/// Assert exit-success and return stdout as a String.
#[track_caller]
fn expect_success(out: &Output) -> String {
    assert!(
        out.status.success(),
        "warden exited {:?}\nstdout: {}\nstderr: {}",
        out.status.code(),
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr),
    );
    String::from_utf8_lossy(&out.stdout).into_owned()
}

/// Assert that the command exited with a non-zero status and return stderr.
#[track_caller]
fn expect_failure(out: &Output) -> String {
    assert!(
        !out.status.success(),
        "Expected warden to fail but it succeeded\nstdout: {}\nstderr: {}",
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr),
    );
    String::from_utf8_lossy(&out.stderr).into_owned()
}

fn write_config(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    path
}

fn minimal_config() -> String {
    format!("secret = \"{SECRET_HEX}\"\nbind-to = \"127.0.0.1:0\"\n")
}

/// A loopback port that was free a moment ago, or `None` if binding is denied.
fn free_port() -> Option<SocketAddr> {
    match TcpListener::bind("127.0.0.1:0") {
        Ok(listener) => Some(listener.local_addr().unwrap()),
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => None,
        Err(err) => panic!("Failed to bind TCP listener for test: {err}"),
    }
}

struct KillOnDrop(Child);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn wait_for_listener(addr: SocketAddr) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if TcpStream::connect(addr).is_ok() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}

// ============================================================================
// generate-secret
// ============================================================================

#[test]
fn test_generate_secret_prints_hex() {
    let dir = TempDir::new().unwrap();
    let first = expect_success(&run_warden(dir.path(), &["generate-secret"]));
    let second = expect_success(&run_warden(dir.path(), &["generate-secret"]));

    let first = first.trim();
    assert_eq!(first.len(), 32);
    assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    assert_ne!(first, second.trim());
}

#[test]
fn test_generate_secret_custom_length() {
    let dir = TempDir::new().unwrap();
    let out = expect_success(&run_warden(dir.path(), &["generate-secret", "--bytes", "32"]));
    assert_eq!(out.trim().len(), 64);
}

#[test]
fn test_generate_secret_rejects_short_length() {
    let dir = TempDir::new().unwrap();
    let stderr = expect_failure(&run_warden(dir.path(), &["generate-secret", "--bytes", "8"]));
    assert!(stderr.contains("at least 16 bytes"));
}

// ============================================================================
// config show
// ============================================================================

#[test]
fn test_config_show_fills_defaults() {
    let dir = TempDir::new().unwrap();
    write_config(dir.path(), "warden.toml", &minimal_config());

    let out = expect_success(&run_warden(dir.path(), &["config", "show"]));
    let parsed: toml::Value =
        toml::from_str(&out).unwrap_or_else(|e| panic!("invalid TOML: {e}\n{out}"));
    assert_eq!(parsed["concurrency"].as_integer(), Some(8192));
    assert_eq!(parsed["network"]["doh-ip"].as_str(), Some("1.1.1.1"));
}

#[test]
fn test_config_show_json_is_valid() {
    let dir = TempDir::new().unwrap();
    let path = write_config(dir.path(), "custom.toml", &minimal_config());

    let out = expect_success(&run_warden(
        dir.path(),
        &["config", "show", "--config", path.to_str().unwrap(), "--format", "json"],
    ));
    let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
    assert_eq!(parsed["bind-to"], "127.0.0.1:0");
    assert!(parsed["defense"]["anti-replay"].is_object());
}

#[test]
fn test_config_show_uses_user_config_dir() {
    let dir = TempDir::new().unwrap();
    let global = dir.path().join(".config").join("warden");
    fs::create_dir_all(&global).unwrap();
    write_config(&global, "warden.toml", "secret = \"ff\"\nconcurrency = 7\n");

    let out = expect_success(&run_warden(dir.path(), &["config", "show"]));
    assert!(out.contains("concurrency = 7"));
}

#[test]
fn test_config_show_without_config_file_fails() {
    let dir = TempDir::new().unwrap();
    let stderr = expect_failure(&run_warden(dir.path(), &["config", "show"]));
    assert!(stderr.contains("No config file found"));
}

#[test]
fn test_config_show_rejects_unknown_key() {
    let dir = TempDir::new().unwrap();
    write_config(dir.path(), "warden.toml", "bind_to = \"0.0.0.0:1\"\n");
    let stderr = expect_failure(&run_warden(dir.path(), &["config", "show"]));
    assert!(stderr.contains("Failed to parse config"));
}

// ============================================================================
// check
// ============================================================================

#[test]
fn test_check_valid_config() {
    let dir = TempDir::new().unwrap();
    write_config(dir.path(), "warden.toml", &minimal_config());

    let out = expect_success(&run_warden(dir.path(), &["check"]));
    assert!(out.contains("Config valid: OK"));
    assert!(out.contains("Upstream: direct"));
    assert!(out.contains("Anti-replay: disabled"));
    assert!(out.contains("Blocklist: disabled"));
}

#[test]
fn test_check_reports_invalid_secret() {
    let dir = TempDir::new().unwrap();
    write_config(dir.path(), "warden.toml", "secret = \"abcd\"\n");

    let out = run_warden(dir.path(), &["check"]);
    expect_failure(&out);
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("Config valid: FAIL"));
    assert!(stdout.contains("secret"));
}

#[test]
fn test_check_loads_local_blocklist() {
    let dir = TempDir::new().unwrap();
    let list = write_config(dir.path(), "block.txt", "# test list\n10.0.0.0/8\n192.0.2.1\n");
    let config = format!(
        "{}\n[defense.blocklist]\nenabled = true\nurls = [\"{}\"]\n\n\
         [defense.anti-replay]\nenabled = true\nmax-size = 1000\n",
        minimal_config(),
        list.display()
    );
    let path = write_config(dir.path(), "warden.toml", &config);

    let out = expect_success(&run_warden(dir.path(), &["check", path.to_str().unwrap()]));
    assert!(out.contains("Blocklist: OK (2 ranges from 1 sources)"));
    assert!(out.contains("Anti-replay: 1000 entries"));
}

#[test]
fn test_check_fails_on_missing_list_file() {
    let dir = TempDir::new().unwrap();
    let config = format!(
        "{}\n[defense.allowlist]\nenabled = true\nurls = [\"{}\"]\n",
        minimal_config(),
        dir.path().join("missing.txt").display()
    );
    write_config(dir.path(), "warden.toml", &config);

    let out = run_warden(dir.path(), &["check"]);
    expect_failure(&out);
    assert!(String::from_utf8_lossy(&out.stdout).contains("Allowlist: FAIL"));
}

#[test]
fn test_check_upstream_pool() {
    let dir = TempDir::new().unwrap();
    let config = format!(
        "{}\n[network]\nproxies = [\"socks5://10.0.0.1:1080\", \"socks5://u:p@10.0.0.2:1080\"]\n",
        minimal_config()
    );
    write_config(dir.path(), "warden.toml", &config);

    let out = expect_success(&run_warden(dir.path(), &["check"]));
    assert!(out.contains("2 SOCKS5 proxies (round-robin)"));
}

// ============================================================================
// run
// ============================================================================

#[test]
fn test_run_rejects_invalid_config_before_binding() {
    let dir = TempDir::new().unwrap();
    let config = format!(
        "{}\n[network]\nproxies = [\"http://10.0.0.1:8080\"]\n",
        minimal_config()
    );
    write_config(dir.path(), "warden.toml", &config);

    let stderr = expect_failure(&run_warden(dir.path(), &["run"]));
    assert!(stderr.contains("network.proxies"));
}

#[test]
fn test_run_rejects_bad_bind_override() {
    let dir = TempDir::new().unwrap();
    write_config(dir.path(), "warden.toml", &minimal_config());

    let stderr = expect_failure(&run_warden(dir.path(), &["run", "--bind", "not-an-address"]));
    assert!(stderr.contains("bind-to"));
}

#[test]
fn test_run_fails_when_initial_list_cannot_load() {
    let dir = TempDir::new().unwrap();
    let config = format!(
        "{}\n[defense.blocklist]\nenabled = true\nurls = [\"{}\"]\n",
        minimal_config(),
        dir.path().join("missing.txt").display()
    );
    write_config(dir.path(), "warden.toml", &config);

    let stderr = expect_failure(&run_warden(dir.path(), &["run"]));
    assert!(stderr.contains("missing.txt"));
}

#[test]
fn test_run_relays_authenticated_client() {
    let Some(proxy_addr) = free_port() else {
        return;
    };
    let target = TcpListener::bind("127.0.0.1:0").unwrap();
    let target_addr = target.local_addr().unwrap();
    std::thread::spawn(move || {
        if let Ok((mut conn, _)) = target.accept() {
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).unwrap();
            conn.write_all(&buf).unwrap();
        }
    });

    let dir = TempDir::new().unwrap();
    write_config(dir.path(), "warden.toml", &minimal_config());
    let child = command(dir.path(), &["run", "--bind", &proxy_addr.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let _guard = KillOnDrop(child);
    assert!(wait_for_listener(proxy_addr), "proxy did not start listening");

    let secret: Vec<u8> = (0..16).map(|i| (i as u8) * 0x11).collect();
    let target = target_addr.to_string();
    let mut send = warden_proxy::Preamble::seal(&secret, &target, SystemTime::now()).unwrap();
    send.extend_from_slice(b"hello");

    let mut client = TcpStream::connect(proxy_addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    client.write_all(&send).unwrap();
    let mut back = [0u8; 5];
    client.read_exact(&mut back).unwrap();
    assert_eq!(&back, b"hello");
}
