//! Turning console output into crash reports.

use serde::Deserialize;
use std::{
    fs::{create_dir_all, write},
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

pub mod linux;
pub mod symbolize;

pub use linux::LinuxReporter;
pub use symbolize::SymbolizeReporter;

/// What a reporter recognised in a piece of output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub title: String,
    /// Minimized report body.
    pub report: Vec<u8>,
}

/// Kernel specific log grammar.
pub trait Reporter {
    /// Offset of the start of the first line carrying a crash marker.
    fn find_crash(&self, output: &[u8]) -> Option<usize>;

    fn contains_crash(&self, output: &[u8]) -> bool {
        self.find_crash(output).is_some()
    }

    /// Title and body of the crash in `output`, `None` if nothing is recognized.
    fn extract(&self, output: &[u8]) -> Option<Extracted>;
}

/// Final payload of a non-clean run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Report {
    pub title: String,
    /// Report body, empty unless a kernel crash was captured.
    pub report: Vec<u8>,
    /// Auxiliary output: what the diagnose command produced for a lost connection,
    /// the reporter's own body for a kernel crash.
    pub output: Vec<u8>,
}

impl Report {
    /// Writes `title`, `report` and `output` files into `dir`.
    pub fn save(&self, dir: &Path) -> io::Result<()> {
        create_dir_all(dir)?;
        write(dir.join("title"), format!("{}\n", self.title))?;
        if !self.report.is_empty() {
            write(dir.join("report"), &self.report)?;
        }
        if !self.output.is_empty() {
            write(dir.join("output"), &self.output)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReportConfig {
    /// Path to syz-symbolize, built-in oops parsing is used if absent.
    pub symbolizer: Option<PathBuf>,
    pub os: String,
    pub arch: String,
    pub kernel_obj_dir: Option<PathBuf>,
    pub kernel_src_dir: Option<PathBuf>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            symbolizer: None,
            os: "linux".to_string(),
            arch: "amd64".to_string(),
            kernel_obj_dir: None,
            kernel_src_dir: None,
        }
    }
}

impl ReportConfig {
    pub fn check(&self) -> Result<(), String> {
        if let Some(symbolizer) = self.symbolizer.as_ref() {
            if !symbolizer.is_file() {
                return Err(format!("{} not exists", symbolizer.display()));
            }
        }
        for dir in self.kernel_obj_dir.iter().chain(self.kernel_src_dir.iter()) {
            if !dir.is_dir() {
                return Err(format!("{} not exists", dir.display()));
            }
        }
        if self.os != "linux" {
            return Err(format!("unsupported os: {}", self.os));
        }
        Ok(())
    }

    pub fn reporter(&self) -> Arc<dyn Reporter + Send + Sync> {
        match self.symbolizer.as_ref() {
            Some(_) => Arc::new(SymbolizeReporter::new(self.clone())),
            None => Arc::new(LinuxReporter::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::read;

    #[test]
    fn save_report() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("crash");
        let r = Report {
            title: "BUG: bad".to_string(),
            report: b"BUG: bad\nDIAGNOSE\n".to_vec(),
            output: Vec::new(),
        };
        r.save(&out).unwrap();
        assert_eq!(read(out.join("title")).unwrap(), b"BUG: bad\n");
        assert_eq!(read(out.join("report")).unwrap(), r.report);
        assert!(!out.join("output").exists());
    }

    #[test]
    fn config_picks_reporter() {
        let cfg = ReportConfig::default();
        cfg.check().unwrap();
        let reporter = cfg.reporter();
        assert!(reporter.contains_crash(b"[   10.1] BUG: bad\n"));

        let cfg = ReportConfig {
            symbolizer: Some(PathBuf::from("/definitely/not/here")),
            ..Default::default()
        };
        assert!(cfg.check().is_err());
        let cfg = ReportConfig {
            os: "windows".to_string(),
            ..Default::default()
        };
        assert!(cfg.check().is_err());
    }
}
