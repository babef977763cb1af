//! Pre-flight diagnostic checks for `hived doctor`.
//!
//! Self-contained — runs before the daemon starts, so it can catch
//! configuration problems before they cause confusing startup failures.

use std::process::Command;

use crate::config::DaemonConfig;

/// The result of a single diagnostic check.
pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

/// Run all diagnostic checks and return a list of results.
pub fn run_doctor(config: &DaemonConfig) -> Vec<CheckResult> {
    vec![
        check_port_available(config),
        check_docker_installed(),
        check_sandbox_image(config),
        check_git_installed(),
        check_data_dir_writable(config),
    ]
}

// ─── Individual checks ────────────────────────────────────────────────────────

fn check_port_available(config: &DaemonConfig) -> CheckResult {
    let addr = format!("{}:{}", config.host, config.port);
    let passed = std::net::TcpListener::bind(&addr).is_ok();
    CheckResult {
        name: "Port available",
        passed,
        detail: if passed {
            format!("{addr} is free")
        } else {
            format!("{addr} is in use by another process")
        },
    }
}

fn check_docker_installed() -> CheckResult {
    match Command::new("docker")
        .args(["version", "--format", "{{.Server.Version}}"])
        .output()
    {
        Ok(out) if out.status.success() => CheckResult {
            name: "Docker available",
            passed: true,
            detail: format!(
                "server {}",
                String::from_utf8_lossy(&out.stdout).trim()
            ),
        },
        Ok(_) => CheckResult {
            name: "Docker available",
            passed: false,
            detail: "docker CLI found but the daemon is not responding".to_string(),
        },
        Err(_) => CheckResult {
            name: "Docker available",
            passed: false,
            detail: "docker CLI not found in PATH".to_string(),
        },
    }
}

fn check_sandbox_image(config: &DaemonConfig) -> CheckResult {
    let passed = Command::new("docker")
        .args(["image", "inspect", &config.sandbox_image])
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false);
    CheckResult {
        name: "Sandbox image present",
        passed,
        detail: if passed {
            config.sandbox_image.clone()
        } else {
            format!("{} not found — pull or build it", config.sandbox_image)
        },
    }
}

fn check_git_installed() -> CheckResult {
    match Command::new("git").arg("--version").output() {
        Ok(out) if out.status.success() => CheckResult {
            name: "git installed",
            passed: true,
            detail: String::from_utf8_lossy(&out.stdout).trim().to_string(),
        },
        _ => CheckResult {
            name: "git installed",
            passed: false,
            detail: "not found in PATH".to_string(),
        },
    }
}

fn check_data_dir_writable(config: &DaemonConfig) -> CheckResult {
    let probe = config.data_dir.join(".doctor-probe");
    let passed = std::fs::create_dir_all(&config.data_dir).is_ok()
        && std::fs::write(&probe, b"ok").is_ok();
    let _ = std::fs::remove_file(&probe);
    CheckResult {
        name: "Data dir writable",
        passed,
        detail: config.data_dir.display().to_string(),
    }
}
