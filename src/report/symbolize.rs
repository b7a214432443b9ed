//! Report extraction delegated to syzkaller's `syz-symbolize`.

use super::{Extracted, LinuxReporter, ReportConfig, Reporter};
use std::{
    env::temp_dir,
    fmt::Write,
    fs::{remove_file, write},
    process::{Command, Stdio},
    sync::atomic::{AtomicU64, Ordering},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SymbolizeError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("syz-symbolize: {0}")]
    SyzSymbolize(String),
    #[error("parse: {0}")]
    Parse(String),
}

/// Uses the built-in oops detection to find crashes, `syz-symbolize` for titles
/// and symbolized bodies.
pub struct SymbolizeReporter {
    config: ReportConfig,
    detector: LinuxReporter,
    log_count: AtomicU64,
}

impl SymbolizeReporter {
    pub fn new(config: ReportConfig) -> Self {
        Self {
            config,
            detector: LinuxReporter::new(),
            log_count: AtomicU64::new(0),
        }
    }

    pub fn symbolize(&self, raw_log: &[u8]) -> Result<Extracted, SymbolizeError> {
        let symbolizer = self
            .config
            .symbolizer
            .as_ref()
            .ok_or_else(|| SymbolizeError::SyzSymbolize("not configured".to_string()))?;
        let n = self.log_count.fetch_add(1, Ordering::Relaxed);
        let log_file = temp_dir().join(format!(
            "healer-monitor-{}-{}.log",
            std::process::id(),
            n
        ));
        write(&log_file, raw_log)?;

        let mut syz_symbolize = Command::new(symbolizer);
        syz_symbolize
            .args(&["-os", self.config.os.as_str()])
            .args(&["-arch", self.config.arch.as_str()]);
        if let Some(kernel_obj) = self.config.kernel_obj_dir.as_ref() {
            syz_symbolize.arg("-kernel_obj").arg(kernel_obj);
        }
        if let Some(kernel_src) = self.config.kernel_src_dir.as_ref() {
            syz_symbolize.arg("-kernel_src").arg(kernel_src);
        }
        let output = syz_symbolize
            .arg(&log_file)
            .stdin(Stdio::null())
            .output();
        let _ = remove_file(&log_file);
        let output = output?;

        if output.status.success() {
            let content = String::from_utf8_lossy(&output.stdout);
            parse(&content).ok_or_else(|| SymbolizeError::Parse(content.into_owned()))
        } else {
            let err = String::from_utf8_lossy(&output.stderr);
            Err(SymbolizeError::SyzSymbolize(err.trim().to_string()))
        }
    }
}

/// First report of syz-symbolize output.
fn parse(content: &str) -> Option<Extracted> {
    let mut lines = content.lines();
    let title = lines
        .by_ref()
        .find_map(|l| l.trim().strip_prefix("TITLE:").map(|t| t.trim().to_string()))?;
    if title.is_empty() {
        return None;
    }

    let mut report = String::new();
    for l in lines {
        if l.contains("TITLE:") {
            break; // next report
        }
        if l.contains("CORRUPTED:") || l.contains("MAINTAINERS") {
            continue;
        }
        writeln!(report, "{}", l).ok()?;
    }
    Some(Extracted {
        title,
        report: report.trim().as_bytes().to_vec(),
    })
}

impl Reporter for SymbolizeReporter {
    fn find_crash(&self, output: &[u8]) -> Option<usize> {
        self.detector.find_crash(output)
    }

    fn extract(&self, output: &[u8]) -> Option<Extracted> {
        // nothing worth a symbolizer run.
        self.detector.find_crash(output)?;
        match self.symbolize(output) {
            Ok(extracted) => Some(extracted),
            Err(e) => {
                log::warn!("symbolize failed, using raw oops: {}", e);
                self.detector.extract(output)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    const OUTPUT: &str = "TITLE: KASAN: use-after-free Read in foo
CORRUPTED: false ()
MAINTAINERS (TO): [a@b.org]
MAINTAINERS (CC): []

BUG: KASAN: use-after-free in foo+0x12/0x30 net/foo.c:42
Call Trace:
 foo net/foo.c:42
";

    fn fake_symbolizer(dir: &Path, script: &str) -> ReportConfig {
        let path = dir.join("syz-symbolize");
        write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        ReportConfig {
            symbolizer: Some(path),
            ..Default::default()
        }
    }

    #[test]
    fn parse_symbolize_output() {
        let e = parse(OUTPUT).unwrap();
        assert_eq!(e.title, "KASAN: use-after-free Read in foo");
        let report = String::from_utf8(e.report).unwrap();
        assert!(report.starts_with("BUG: KASAN"));
        assert!(report.ends_with("foo net/foo.c:42"));
        assert!(!report.contains("MAINTAINERS"));

        assert!(parse("nothing\n").is_none());
        assert!(parse("TITLE: \n").is_none());
    }

    #[test]
    fn extract_through_symbolizer() {
        let dir = tempfile::tempdir().unwrap();
        let script = format!("#!/bin/sh\ncat <<'EOF'\n{}EOF\n", OUTPUT);
        let r = SymbolizeReporter::new(fake_symbolizer(dir.path(), &script));
        let e = r.extract(b"BUG: KASAN: use-after-free in foo+0x12/0x30\n").unwrap();
        assert_eq!(e.title, "KASAN: use-after-free Read in foo");
        assert!(r.extract(b"no oops here\n").is_none());
    }

    #[test]
    fn symbolizer_failure_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let script = "#!/bin/sh\necho broken >&2\nexit 1\n";
        let r = SymbolizeReporter::new(fake_symbolizer(dir.path(), script));
        assert!(matches!(
            r.symbolize(b"BUG: bad\n"),
            Err(SymbolizeError::SyzSymbolize(e)) if e == "broken"
        ));
        let e = r.extract(b"BUG: bad\n").unwrap();
        assert_eq!(e.title, "BUG: bad");
    }
}
