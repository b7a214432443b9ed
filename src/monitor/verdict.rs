use crate::report::{Report, Reporter};
use std::fmt;

pub const LOST_CONNECTION_CRASH: &str = "lost connection to test machine";
pub const NO_OUTPUT_CRASH: &str = "no output from test machine";

/// Outcome of one monitored run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Clean,
    /// Command or transport died unexpectedly, `diagnosis` is the diagnose output.
    LostConnection { diagnosis: Vec<u8> },
    /// No liveness marker for too long.
    NoOutputHang,
    /// `report` is the captured window as it is, `extracted` the reporter's own body.
    KernelCrash {
        title: String,
        report: Vec<u8>,
        extracted: Vec<u8>,
    },
}

impl Verdict {
    pub fn is_clean(&self) -> bool {
        matches!(self, Verdict::Clean)
    }

    pub fn title(&self) -> Option<&str> {
        match self {
            Verdict::Clean => None,
            Verdict::LostConnection { .. } => Some(LOST_CONNECTION_CRASH),
            Verdict::NoOutputHang => Some(NO_OUTPUT_CRASH),
            Verdict::KernelCrash { title, .. } => Some(title),
        }
    }

    /// Report handed to the caller, `None` for clean runs.
    pub fn report(&self) -> Option<Report> {
        let report = match self {
            Verdict::Clean => return None,
            Verdict::LostConnection { diagnosis } => Report {
                title: LOST_CONNECTION_CRASH.to_string(),
                report: Vec::new(),
                output: diagnosis.clone(),
            },
            Verdict::NoOutputHang => Report {
                title: NO_OUTPUT_CRASH.to_string(),
                ..Default::default()
            },
            Verdict::KernelCrash {
                title,
                report,
                extracted,
            } => Report {
                title: title.clone(),
                report: report.clone(),
                output: extracted.clone(),
            },
        };
        Some(report)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.title().unwrap_or("clean"))
    }
}

/// Builds the crash verdict from the captured window, `crash_line` is the offset
/// of the crash line in it. The reporter only sees the window from the crash line
/// on, the report body keeps the context before it.
pub fn kernel_crash<R: Reporter + ?Sized>(
    reporter: &R,
    captured: Vec<u8>,
    crash_line: usize,
) -> Option<Verdict> {
    let extracted = reporter.extract(&captured[crash_line.min(captured.len())..])?;
    Some(Verdict::KernelCrash {
        title: extracted.title,
        report: captured,
        extracted: extracted.report,
    })
}
