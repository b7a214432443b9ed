//! Test machine reached over ssh. The machine is booted and torn down elsewhere.

use crate::utils::{
    lock,
    process::{self, ensure_runtime, OutputSender},
};
use crate::vm::{Execution, Instance, InstanceError, Stop};
use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Duration,
};

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    pub addr: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub key: PathBuf,
    #[serde(default = "default_user")]
    pub user: String,
}

fn default_port() -> u16 {
    22
}

fn default_user() -> String {
    "root".to_string()
}

impl SshConfig {
    pub fn check(&self) -> Result<(), String> {
        if self.addr.is_empty() {
            return Err("empty ssh address".to_string());
        }
        if self.user.is_empty() {
            return Err("empty ssh username".to_string());
        }
        if !self.key.is_file() {
            return Err(format!("ssh key not exists: {}", self.key.display()));
        }
        Ok(())
    }
}

const SSH_OPTIONS: [&str; 12] = [
    "-F",
    "/dev/null",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "BatchMode=yes",
    "-o",
    "IdentitiesOnly=yes",
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "ConnectTimeout=10s",
];

/// Ssh command up to the destination, remote ports in `forwards` are tunneled
/// back to the same host ports.
pub fn ssh_basic_cmd(cfg: &SshConfig, forwards: &[u16]) -> Command {
    let mut ssh_cmd = Command::new("ssh");
    ssh_cmd
        .args(&SSH_OPTIONS)
        .arg("-p")
        .arg(cfg.port.to_string())
        .arg("-i")
        .arg(&cfg.key);
    for port in forwards {
        ssh_cmd
            .arg("-R")
            .arg(format!("{}:127.0.0.1:{}", port, port));
    }
    ssh_cmd.arg(format!("{}@{}", cfg.user, cfg.addr));
    ssh_cmd
}

pub fn scp_basic_cmd(cfg: &SshConfig) -> Command {
    let mut scp_cmd = Command::new("scp");
    scp_cmd
        .args(&SSH_OPTIONS)
        .arg("-P")
        .arg(cfg.port.to_string())
        .arg("-i")
        .arg(&cfg.key);
    scp_cmd
}

pub struct SshInstance {
    index: usize,
    cfg: SshConfig,
    diagnose_cmd: Option<String>,
    forwards: Vec<u16>,
    output: OutputSender,
    closed: bool,
}

impl SshInstance {
    pub fn new(index: usize, cfg: SshConfig, diagnose_cmd: Option<String>) -> Self {
        Self {
            index,
            cfg,
            diagnose_cmd,
            forwards: Vec::new(),
            output: OutputSender::default(),
            closed: false,
        }
    }

    fn run_cmd(&self, command: &str) -> Command {
        let mut ssh_cmd = ssh_basic_cmd(&self.cfg, &self.forwards);
        ssh_cmd.arg(command);
        ssh_cmd
    }
}

impl Instance for SshInstance {
    fn run(
        &mut self,
        timeout: Duration,
        stop: Option<Stop>,
        command: &str,
    ) -> Result<Execution, InstanceError> {
        if self.closed {
            return Err(InstanceError::Closed);
        }
        ensure_runtime()?;
        log::debug!("vm-{}: ssh run: {}", self.index, command);
        let cmd = tokio::process::Command::from(self.run_cmd(command));
        let (exec, out) = process::spawn(cmd, timeout, stop).map_err(InstanceError::Spawn)?;
        *lock(&self.output) = Some(out);
        Ok(exec)
    }

    fn diagnose(&self) -> bool {
        match self.diagnose_cmd.as_ref() {
            Some(diag) if !self.closed => {
                let mut ssh_cmd = ssh_basic_cmd(&self.cfg, &[]);
                ssh_cmd.arg(diag);
                process::diagnose(ssh_cmd, &self.output)
            }
            _ => false,
        }
    }

    fn copy(&mut self, host_src: &Path) -> Result<PathBuf, InstanceError> {
        let copy_err = |reason: String| InstanceError::Copy {
            path: host_src.display().to_string(),
            reason,
        };
        let file_name = host_src
            .file_name()
            .ok_or_else(|| copy_err("not a file".to_string()))?;
        let guest_path = PathBuf::from(format!("~/{}", file_name.to_string_lossy()));

        let output = scp_basic_cmd(&self.cfg)
            .arg(host_src)
            .arg(format!(
                "{}@{}:{}",
                self.cfg.user,
                self.cfg.addr,
                guest_path.display()
            ))
            .stdin(Stdio::null())
            .output()
            .map_err(|e| copy_err(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(copy_err(stderr.trim().to_string()));
        }
        Ok(guest_path)
    }

    fn forward(&mut self, port: u16) -> Result<String, InstanceError> {
        if !self.forwards.contains(&port) {
            self.forwards.push(port);
        }
        Ok(format!("127.0.0.1:{}", port))
    }

    fn close(&mut self) {
        self.closed = true;
        lock(&self.output).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_config() -> SshConfig {
        SshConfig {
            addr: "10.0.2.15".to_string(),
            port: 10022,
            key: PathBuf::from("/tmp/id_rsa"),
            user: "root".to_string(),
        }
    }

    fn args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn ssh_cmd_line() {
        let mut inst = SshInstance::new(0, dummy_config(), None);
        inst.forward(8080).unwrap();
        inst.forward(8080).unwrap();
        let cmd = inst.run_cmd("./syz-fuzzer -v");
        let args = args(&cmd);
        assert_eq!(cmd.get_program(), "ssh");
        assert!(args.windows(2).any(|w| w == ["-p", "10022"]));
        assert!(args.contains(&"root@10.0.2.15".to_string()));
        assert_eq!(
            args.iter().filter(|a| *a == "8080:127.0.0.1:8080").count(),
            1
        );
        // options go before the destination, the command after it.
        let dest = args.iter().position(|a| a == "root@10.0.2.15").unwrap();
        let fwd = args.iter().position(|a| a == "-R").unwrap();
        assert!(fwd < dest);
        assert_eq!(args[dest + 1..], ["./syz-fuzzer -v"]);
    }

    #[test]
    fn scp_uses_upper_port_flag() {
        let args = args(&scp_basic_cmd(&dummy_config()));
        assert!(args.windows(2).any(|w| w == ["-P", "10022"]));
    }

    #[test]
    fn no_diagnose_without_command() {
        let inst = SshInstance::new(0, dummy_config(), Some("dmesg".to_string()));
        // no run yet, nowhere to write.
        assert!(!inst.diagnose());
        let inst = SshInstance::new(0, dummy_config(), None);
        assert!(!inst.diagnose());
    }

    #[test]
    fn config_check() {
        let mut cfg = dummy_config();
        cfg.key = PathBuf::from("/definitely/not/here");
        assert!(cfg.check().is_err());
        cfg.user.clear();
        assert!(cfg.check().is_err());
    }
}
