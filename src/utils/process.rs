//! Long running child processes: stream stdout/stderr, enforce the time budget.

use crate::utils::{lock, stopped};
use crate::vm::{Chunk, Execution, RunError, Stop};
use bytes::{Bytes, BytesMut};
use nix::{
    sys::signal::{killpg, Signal},
    unistd::{setsid, Pid},
};
use std::{
    process::Stdio,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    sync::{mpsc, oneshot},
};

/// Sender into the output stream of the current run, shared with the diagnose thread.
pub type OutputSender = Arc<Mutex<Option<mpsc::UnboundedSender<Chunk>>>>;

/// Spawns `cmd` in its own session and monitors it in background tasks.
///
/// Must be called inside a tokio runtime.
pub fn spawn(
    mut cmd: Command,
    timeout: Duration,
    stop: Option<Stop>,
) -> std::io::Result<(Execution, mpsc::UnboundedSender<Chunk>)> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    unsafe {
        cmd.pre_exec(|| {
            let _ = setsid();
            Ok(())
        });
    }
    let mut child = cmd.spawn()?;

    let (exec, out_tx, done_tx) = Execution::channel();
    if let Some(stdout) = child.stdout.take() {
        redirect(stdout, out_tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        redirect(stderr, out_tx.clone());
    }
    tokio::spawn(wait(child, timeout, stop, done_tx));
    Ok((exec, out_tx))
}

fn redirect<R>(mut src: R, tx: mpsc::UnboundedSender<Chunk>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let mut buf = BytesMut::with_capacity(4096);
            match src.read_buf(&mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(Chunk::Console(buf.freeze())).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::debug!("output read: {}", e);
                    break;
                }
            }
        }
    });
}

async fn wait(
    mut child: Child,
    timeout: Duration,
    mut stop: Option<Stop>,
    done: oneshot::Sender<Result<(), RunError>>,
) {
    let ret = tokio::select! {
        status = child.wait() => match status {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(RunError::Exited(status)),
            Err(e) => Err(RunError::Wait(e)),
        },
        _ = tokio::time::sleep(timeout) => Err(RunError::Timeout),
        _ = stopped(&mut stop) => Err(RunError::Timeout),
    };
    if matches!(ret, Err(RunError::Timeout)) {
        kill(&mut child).await;
    }
    // the monitor may already be gone.
    let _ = done.send(ret);
}

async fn kill(child: &mut Child) {
    if let Some(pid) = child.id() {
        // setsid made the child a group leader.
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
    let _ = child.kill().await;
}

/// Runs a diagnose command on a background thread and forwards its output into
/// the current run's output stream.
pub fn diagnose(mut cmd: std::process::Command, output: &OutputSender) -> bool {
    let tx = match lock(output).as_ref() {
        Some(tx) => tx.clone(),
        None => return false,
    };
    cmd.stdin(Stdio::null());
    std::thread::Builder::new()
        .name("healer-diagnose".into())
        .spawn(move || match cmd.output() {
            Ok(out) => {
                for data in [out.stdout, out.stderr] {
                    if !data.is_empty() {
                        let _ = tx.send(Chunk::Diagnosis(Bytes::from(data)));
                    }
                }
            }
            Err(e) => log::warn!("diagnose: failed to spawn {:?}: {}", cmd, e),
        })
        .map_err(|e| log::warn!("diagnose: failed to spawn thread: {}", e))
        .is_ok()
}

/// Fails if there is no tokio runtime to drive the background tasks.
pub fn ensure_runtime() -> Result<(), crate::vm::InstanceError> {
    tokio::runtime::Handle::try_current()
        .map(|_| ())
        .map_err(|e| crate::vm::InstanceError::Runtime(e.to_string()))
}
