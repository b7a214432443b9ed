//! Capabilities the monitor consumes from the machine layer.
//!
//! An [`Instance`] runs one command at a time and hands back an [`Execution`]:
//! an output stream of console chunks plus a completion signal that fires
//! exactly once. Booting, tearing down and scheduling machines is not done here.

use bytes::Bytes;
use std::{
    path::{Path, PathBuf},
    process::ExitStatus,
    time::Duration,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

pub mod local;
pub mod pool;
pub mod ssh;

/// External stop signal, `true` means stop.
pub type Stop = watch::Receiver<bool>;

/// Piece of the output stream, tagged with who wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// Console output of the command and the kernel.
    Console(Bytes),
    /// Output of the diagnose command.
    Diagnosis(Bytes),
}

impl Chunk {
    pub fn bytes(&self) -> &Bytes {
        match self {
            Chunk::Console(b) | Chunk::Diagnosis(b) => b,
        }
    }
}

/// Output stream and completion signal of a running command.
#[derive(Debug)]
pub struct Execution {
    pub output: mpsc::UnboundedReceiver<Chunk>,
    pub done: oneshot::Receiver<Result<(), RunError>>,
}

impl Execution {
    /// Creates an execution together with its feeding ends.
    pub fn channel() -> (
        Self,
        mpsc::UnboundedSender<Chunk>,
        oneshot::Sender<Result<(), RunError>>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        let exec = Execution {
            output: out_rx,
            done: done_rx,
        };
        (exec, out_tx, done_tx)
    }
}

/// Value carried by the completion signal when the command did not finish cleanly.
#[derive(Debug, Error)]
pub enum RunError {
    /// The run's own time budget expired or it was stopped on purpose.
    #[error("timeout")]
    Timeout,
    #[error("command exited with {0}")]
    Exited(ExitStatus),
    #[error("wait: {0}")]
    Wait(#[from] std::io::Error),
    #[error("completion signal dropped")]
    Closed,
    #[error("transport: {0}")]
    Transport(String),
}

impl RunError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RunError::Timeout)
    }
}

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("spawn: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("copy '{path}': {reason}")]
    Copy { path: String, reason: String },
    #[error("instance closed")]
    Closed,
    #[error("instance index {index} out of range, pool size {count}")]
    OutOfRange { index: usize, count: usize },
    #[error("no runtime: {0}")]
    Runtime(String),
}

/// A machine that can run commands.
pub trait Instance {
    /// Starts `command`, the completion signal carries [`RunError::Timeout`] once
    /// `timeout` elapses or `stop` fires.
    fn run(
        &mut self,
        timeout: Duration,
        stop: Option<Stop>,
        command: &str,
    ) -> Result<Execution, InstanceError>;

    /// Best-effort query for extra machine state. Whatever it finds is written into
    /// the output stream of the current run as [`Chunk::Diagnosis`]. Returns whether
    /// a diagnose command was issued.
    fn diagnose(&self) -> bool;

    /// Copies a host file to the machine, returns the path on the machine.
    fn copy(&mut self, host_src: &Path) -> Result<PathBuf, InstanceError>;

    /// Makes host `port` reachable from the machine, returns the address to use there.
    fn forward(&mut self, port: u16) -> Result<String, InstanceError>;

    fn close(&mut self);
}

/// Creates instances.
pub trait Pool {
    type Instance: Instance;

    fn count(&self) -> usize;
    fn create(&self, index: usize) -> Result<Self::Instance, InstanceError>;
}
