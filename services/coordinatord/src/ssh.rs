//! SSH subprocess invocations used by the sync worker.
//!
//! Two independently retryable actions, both multiplexed over one
//! authenticated transport via a control master: opening (or refreshing)
//! the reverse tunnel, and touching a remote marker file that triggers the
//! upstream sync.

use std::process::Stdio;

use sgm_protocol::Serno;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::SshConfig;

#[derive(Debug, Error)]
pub enum SshError {
    #[error("spawning ssh: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("ssh touch exited with status {0}")]
    TouchFailed(std::process::ExitStatus),
}

const KEEPALIVE_INTERVAL: &str = "5";
const KEEPALIVE_COUNT_MAX: &str = "3";

fn base_args(ssh: &SshConfig, control_path: &str) -> Vec<String> {
    vec![
        "-i".to_owned(),
        ssh.identity_file.display().to_string(),
        "-o".to_owned(),
        format!("ControlPath={control_path}"),
        "-o".to_owned(),
        "ControlMaster=auto".to_owned(),
        "-o".to_owned(),
        "ControlPersist=yes".to_owned(),
        "-o".to_owned(),
        "StrictHostKeyChecking=no".to_owned(),
        "-o".to_owned(),
        format!("ServerAliveInterval={KEEPALIVE_INTERVAL}"),
        "-o".to_owned(),
        format!("ServerAliveCountMax={KEEPALIVE_COUNT_MAX}"),
    ]
}

fn control_path(ssh: &SshConfig, serno: &Serno, port: u16) -> String {
    ssh.control_path_template
        .replace("%h", "localhost")
        .replace("%p", &port.to_string())
        .replace("%r", serno.as_str())
}

/// Runs the two SSH invocations for one sync cycle: open/refresh the
/// reverse tunnel, then touch the remote marker file.
pub async fn trigger_sync(ssh: &SshConfig, serno: &Serno, tunnel_port: u16) -> Result<(), SshError> {
    let control_path = control_path(ssh, serno, tunnel_port);

    // An already-mapped port is expected to fail benignly here — the
    // tunnel is already up from a previous cycle — so this step's error is
    // intentionally ignored.
    if let Err(e) = open_tunnel(ssh, &control_path, tunnel_port).await {
        debug!(%serno, tunnel_port, error = %e, "ssh: tunnel open/refresh failed (benign if already mapped)");
    }

    touch_remote(ssh, &control_path, serno, tunnel_port).await
}

async fn open_tunnel(ssh: &SshConfig, control_path: &str, port: u16) -> Result<(), SshError> {
    let mut args = base_args(ssh, control_path);
    args.push("-f".to_owned());
    args.push("-N".to_owned());
    args.push("-R".to_owned());
    args.push(format!("{port}:localhost:{port}"));
    args.push(format!("{}@localhost", ssh.remote_user));

    let status = Command::new("ssh")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    if !status.success() {
        warn!(?status, "ssh: tunnel command exited non-zero");
    }
    Ok(())
}

async fn touch_remote(
    ssh: &SshConfig,
    control_path: &str,
    serno: &Serno,
    port: u16,
) -> Result<(), SshError> {
    let mut args = base_args(ssh, control_path);
    let remote_path = format!("{}/method={},serno={}", ssh.remote_sync_dir, port, serno);
    args.push(format!("{}@localhost", ssh.remote_user));
    args.push(format!("touch {remote_path}"));

    let status = Command::new("ssh")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    if status.success() {
        Ok(())
    } else {
        Err(SshError::TouchFailed(status))
    }
}
