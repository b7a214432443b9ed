use crate::config::InstanceConfig;
use crate::vm::{
    local::LocalInstance, ssh::SshInstance, Execution, Instance, InstanceError, Pool, Stop,
};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

/// Instance handed out by [`ProcessPool`].
pub enum ProcessInstance {
    Local(LocalInstance),
    Ssh(SshInstance),
}

impl Instance for ProcessInstance {
    fn run(
        &mut self,
        timeout: Duration,
        stop: Option<Stop>,
        command: &str,
    ) -> Result<Execution, InstanceError> {
        match self {
            ProcessInstance::Local(inst) => inst.run(timeout, stop, command),
            ProcessInstance::Ssh(inst) => inst.run(timeout, stop, command),
        }
    }

    fn diagnose(&self) -> bool {
        match self {
            ProcessInstance::Local(inst) => inst.diagnose(),
            ProcessInstance::Ssh(inst) => inst.diagnose(),
        }
    }

    fn copy(&mut self, host_src: &Path) -> Result<PathBuf, InstanceError> {
        match self {
            ProcessInstance::Local(inst) => inst.copy(host_src),
            ProcessInstance::Ssh(inst) => inst.copy(host_src),
        }
    }

    fn forward(&mut self, port: u16) -> Result<String, InstanceError> {
        match self {
            ProcessInstance::Local(inst) => inst.forward(port),
            ProcessInstance::Ssh(inst) => inst.forward(port),
        }
    }

    fn close(&mut self) {
        match self {
            ProcessInstance::Local(inst) => inst.close(),
            ProcessInstance::Ssh(inst) => inst.close(),
        }
    }
}

impl Drop for ProcessInstance {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct ProcessPool {
    config: InstanceConfig,
}

impl ProcessPool {
    pub fn new(config: InstanceConfig) -> Self {
        Self { config }
    }
}

impl Pool for ProcessPool {
    type Instance = ProcessInstance;

    fn count(&self) -> usize {
        self.config.count
    }

    fn create(&self, index: usize) -> Result<ProcessInstance, InstanceError> {
        if index >= self.count() {
            return Err(InstanceError::OutOfRange {
                index,
                count: self.count(),
            });
        }
        let diagnose = self.config.diagnose.clone();
        let inst = match self.config.ssh.as_ref() {
            Some(ssh) => ProcessInstance::Ssh(SshInstance::new(index, ssh.clone(), diagnose)),
            None => ProcessInstance::Local(LocalInstance::new(
                index,
                self.config.workdir.clone(),
                diagnose,
            )),
        };
        Ok(inst)
    }
}
