//! Commands executed directly on the host through `sh -c`.

use crate::utils::{
    lock,
    process::{self, ensure_runtime, OutputSender},
};
use crate::vm::{Execution, Instance, InstanceError, Stop};
use std::{
    fs::canonicalize,
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};

pub struct LocalInstance {
    index: usize,
    workdir: PathBuf,
    diagnose_cmd: Option<String>,
    output: OutputSender,
    closed: bool,
}

impl LocalInstance {
    pub fn new(index: usize, workdir: PathBuf, diagnose_cmd: Option<String>) -> Self {
        Self {
            index,
            workdir,
            diagnose_cmd,
            output: OutputSender::default(),
            closed: false,
        }
    }
}

fn sh(command: &str, workdir: &Path) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command).current_dir(workdir);
    cmd
}

impl Instance for LocalInstance {
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
        log::debug!("vm-{}: local run: {}", self.index, command);
        let cmd = tokio::process::Command::from(sh(command, &self.workdir));
        let (exec, out) = process::spawn(cmd, timeout, stop).map_err(InstanceError::Spawn)?;
        *lock(&self.output) = Some(out);
        Ok(exec)
    }

    fn diagnose(&self) -> bool {
        match self.diagnose_cmd.as_ref() {
            Some(diag) if !self.closed => {
                process::diagnose(sh(diag, &self.workdir), &self.output)
            }
            _ => false,
        }
    }

    fn copy(&mut self, host_src: &Path) -> Result<PathBuf, InstanceError> {
        canonicalize(host_src).map_err(|e| InstanceError::Copy {
            path: host_src.display().to_string(),
            reason: e.to_string(),
        })
    }

    fn forward(&mut self, port: u16) -> Result<String, InstanceError> {
        Ok(format!("127.0.0.1:{}", port))
    }

    fn close(&mut self) {
        self.closed = true;
        lock(&self.output).take();
    }
}
