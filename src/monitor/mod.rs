//! Execution monitor, reduces the output stream and completion signal of one
//! command to a single [`Verdict`]. It never fails, every run ends with a verdict.

use crate::config::MonitorConfig;
use crate::report::Reporter;
use crate::utils::{contains, stopped};
use crate::vm::{Chunk, Execution, Instance, InstanceError, RunError, Stop};
use std::{future::pending, sync::Arc, time::Duration};
use tokio::{
    task,
    time::{self, interval_at, Instant, MissedTickBehavior},
};

pub mod diagnoser;
pub mod transcript;
pub mod verdict;

pub use diagnoser::Diagnoser;
pub use transcript::Transcript;
pub use verdict::{Verdict, LOST_CONNECTION_CRASH, NO_OUTPUT_CRASH};

pub const EXECUTING_PROGRAM_STR1: &[u8] = b"executing program";
pub const EXECUTING_PROGRAM_STR2: &[u8] = b"executed programs:";
pub const FUZZER_PREEMPTED_STR: &[u8] = b"SYZ-FUZZER: PREEMPTED";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Watching output, `wind_down` is set once completion asked for a grace wait.
    Collecting(Option<WindDown>),
    /// Crash line at `crash_line` seen, capturing from `report_start` until `finalize_at`.
    CrashPending {
        report_start: usize,
        crash_line: usize,
        finalize_at: Instant,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindDown {
    /// Permitted exit, waiting for late crash output.
    Exit { until: Instant },
    /// Unexpected exit, draining diagnose output and late crash output.
    LostConnection { until: Instant },
}

impl State {
    fn deadline(&self) -> Option<Instant> {
        match *self {
            State::Collecting(None) => None,
            State::Collecting(Some(WindDown::Exit { until }))
            | State::Collecting(Some(WindDown::LostConnection { until })) => Some(until),
            State::CrashPending { finalize_at, .. } => Some(finalize_at),
        }
    }
}

/// Monitor of a single run, consumed by [`Monitor::run`].
pub struct Monitor<'a, I: ?Sized, R: ?Sized> {
    diagnoser: Diagnoser<'a, I>,
    reporter: Arc<R>,
    config: &'a MonitorConfig,
    stop: Option<Stop>,

    transcript: Transcript,
    state: State,
    can_exit: bool,
    /// Completion signal received.
    completed: bool,
    preempted: bool,
    /// Stop arrived during a crash capture.
    stop_deferred: bool,
    last_executed: Instant,
}

impl<'a, I, R> Monitor<'a, I, R>
where
    I: Instance + ?Sized,
    R: Reporter + Send + Sync + ?Sized + 'static,
{
    pub fn new(inst: &'a I, reporter: Arc<R>, config: &'a MonitorConfig) -> Self {
        Self {
            diagnoser: Diagnoser::new(inst),
            reporter,
            config,
            stop: None,
            transcript: Transcript::new(),
            state: State::Collecting(None),
            can_exit: false,
            completed: false,
            preempted: false,
            stop_deferred: false,
            last_executed: Instant::now(),
        }
    }

    /// External cancellation, the run is sealed clean once it reads `true`.
    pub fn with_stop(mut self, stop: Stop) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Monitors `exec` until a verdict is reached. `can_exit` tells whether the
    /// command may finish on its own.
    pub async fn run(mut self, exec: Execution, can_exit: bool) -> Verdict {
        let Execution {
            mut output,
            mut done,
        } = exec;
        let mut stop = self.stop.take();
        let mut output_open = true;
        let mut done_pending = true;

        self.can_exit = can_exit;
        self.last_executed = Instant::now();
        // interval panics on a zero period.
        let tick = self.config.tick_interval.max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + tick, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let verdict = loop {
            let deadline = self.state.deadline();
            // output goes first, a crash racing the completion must not be lost.
            let sealed = tokio::select! {
                biased;
                chunk = output.recv(), if output_open => match chunk {
                    Some(chunk) => self.on_output(chunk),
                    None => {
                        log::debug!("output stream closed");
                        output_open = false;
                        None
                    }
                },
                ret = &mut done, if done_pending => {
                    done_pending = false;
                    self.on_completion(ret.unwrap_or(Err(RunError::Closed)))
                },
                _ = stopped(&mut stop), if !self.stop_deferred => self.on_stop(),
                _ = sleep_until(deadline) => self.on_deadline().await,
                _ = ticker.tick() => self.on_tick(),
            };
            if let Some(verdict) = sealed {
                break verdict;
            }
        };
        self.seal(verdict)
    }

    fn on_output(&mut self, chunk: Chunk) -> Option<Verdict> {
        let data = match chunk {
            Chunk::Console(data) => data,
            Chunk::Diagnosis(data) => {
                // kept in the report, never taken for markers.
                self.transcript.append_opaque(&data);
                self.diagnoser.record(&data);
                return None;
            }
        };
        self.transcript.append(&data);
        let live = self.fresh_marker(EXECUTING_PROGRAM_STR1)
            || self.fresh_marker(EXECUTING_PROGRAM_STR2);
        let preempted = self.fresh_marker(FUZZER_PREEMPTED_STR);
        let crash = self
            .reporter
            .find_crash(self.transcript.unscanned())
            .map(|off| self.transcript.line_start() + off);
        self.transcript.commit_scan();

        if live {
            self.last_executed = Instant::now();
        }
        if preempted {
            if let Some(verdict) = self.on_preempted() {
                return Some(verdict);
            }
        }
        if let (State::Collecting(_), Some(pos)) = (self.state, crash) {
            if !self.preempted {
                self.begin_capture(pos);
            }
        }
        None
    }

    fn fresh_marker(&self, marker: &[u8]) -> bool {
        contains(self.transcript.fresh(marker.len()), marker)
    }

    fn on_preempted(&mut self) -> Option<Verdict> {
        if !self.preempted {
            log::info!("fuzzer preempted");
            self.preempted = true;
        }
        if let State::CrashPending { .. } = self.state {
            log::debug!("crash capture voided by preemption");
            self.state = State::Collecting(None);
            if self.completed || self.stop_deferred {
                return Some(Verdict::Clean);
            }
        }
        None
    }

    fn begin_capture(&mut self, crash_line: usize) {
        let report_start = crash_line.saturating_sub(self.config.context_window);
        let finalize_at = Instant::now() + self.config.finalize_grace;
        log::debug!(
            "crash marker at {}, capturing from {} for {:?}",
            crash_line,
            report_start,
            self.config.finalize_grace
        );
        self.state = State::CrashPending {
            report_start,
            crash_line,
            finalize_at,
        };
        self.diagnoser.fire();
    }

    fn on_completion(&mut self, ret: Result<(), RunError>) -> Option<Verdict> {
        self.completed = true;
        if let State::CrashPending { .. } = self.state {
            log::debug!("completion during crash capture: {:?}", ret);
            return None;
        }
        let until = Instant::now() + self.config.finalize_grace;
        match ret {
            Err(e) if e.is_timeout() => {
                log::debug!("run timed out");
                Some(Verdict::Clean)
            }
            Ok(()) if self.can_exit => {
                log::debug!(
                    "command exited, waiting {:?} for late output",
                    self.config.finalize_grace
                );
                self.state = State::Collecting(Some(WindDown::Exit { until }));
                None
            }
            ret => {
                match ret {
                    Ok(()) => log::info!("command exited unexpectedly"),
                    Err(e) => log::info!("command failed: {}", e),
                }
                self.diagnoser.fire();
                self.state = State::Collecting(Some(WindDown::LostConnection { until }));
                None
            }
        }
    }

    async fn on_deadline(&mut self) -> Option<Verdict> {
        match self.state {
            State::CrashPending {
                report_start,
                crash_line,
                ..
            } => Some(self.finalize_crash(report_start, crash_line).await),
            State::Collecting(Some(WindDown::Exit { .. })) => Some(Verdict::Clean),
            State::Collecting(Some(WindDown::LostConnection { .. })) => {
                Some(Verdict::LostConnection {
                    diagnosis: self.diagnoser.output().to_vec(),
                })
            }
            State::Collecting(None) => None,
        }
    }

    /// Extraction may run an external symbolizer, so it is kept off the runtime.
    async fn finalize_crash(&self, report_start: usize, crash_line: usize) -> Verdict {
        let captured = self.transcript.since(report_start).to_vec();
        let len = captured.len();
        let reporter = Arc::clone(&self.reporter);
        let crash_line = crash_line - report_start;
        let ret = task::spawn_blocking(move || {
            verdict::kernel_crash(&*reporter, captured, crash_line)
        })
        .await;
        match ret {
            Ok(Some(verdict)) => verdict,
            Ok(None) => {
                log::warn!(
                    "nothing recognized in {} captured bytes, reporting lost connection",
                    len
                );
                Verdict::LostConnection {
                    diagnosis: self.diagnoser.output().to_vec(),
                }
            }
            Err(e) => {
                log::warn!("report extraction failed: {}", e);
                Verdict::LostConnection {
                    diagnosis: self.diagnoser.output().to_vec(),
                }
            }
        }
    }

    fn on_tick(&mut self) -> Option<Verdict> {
        if self.state != State::Collecting(None) || self.completed {
            return None;
        }
        let elapsed = self.last_executed.elapsed();
        if elapsed > self.config.no_output_timeout {
            log::debug!("no liveness marker for {:?}", elapsed);
            return Some(Verdict::NoOutputHang);
        }
        None
    }

    fn on_stop(&mut self) -> Option<Verdict> {
        if let State::CrashPending { .. } = self.state {
            log::debug!("stop requested, finishing crash capture first");
            self.stop_deferred = true;
            return None;
        }
        log::debug!("stop requested");
        Some(Verdict::Clean)
    }

    fn seal(&self, verdict: Verdict) -> Verdict {
        let verdict = if self.preempted && !verdict.is_clean() {
            log::debug!("preempted, dropping: {}", verdict);
            Verdict::Clean
        } else {
            verdict
        };
        log::info!(
            "run sealed: {} ({} bytes of output)",
            verdict,
            self.transcript.len()
        );
        verdict
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => pending().await,
    }
}

/// Command to run and monitor.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub command: String,
    pub timeout: Duration,
    pub stop: Option<Stop>,
    /// Whether the command may exit on its own.
    pub can_exit: bool,
}

/// Runs `req` on `inst` and monitors it.
pub async fn run_and_monitor<I, R>(
    inst: &mut I,
    reporter: Arc<R>,
    config: &MonitorConfig,
    req: ExecutionRequest,
) -> Result<Verdict, InstanceError>
where
    I: Instance + ?Sized,
    R: Reporter + Send + Sync + ?Sized + 'static,
{
    let exec = inst.run(req.timeout, req.stop.clone(), &req.command)?;
    let mut monitor = Monitor::new(&*inst, reporter, config);
    if let Some(stop) = req.stop {
        monitor = monitor.with_stop(stop);
    }
    Ok(monitor.run(exec, req.can_exit).await)
}
