//! Oops detection for linux console output.

use super::{Extracted, Reporter};
use regex::bytes::Regex;

lazy_static! {
    static ref OOPS: Regex = Regex::new(concat!(
        "BUG:|WARNING:|INFO:|general protection fault|Kernel panic|kernel BUG at",
        "|[Uu]nable to handle kernel|divide error:|invalid opcode:|UBSAN:",
        "|unreferenced object|Internal error:|kernel stack overflow",
    ))
    .unwrap();
    /// Lines that look like an oops but are not.
    static ref IGNORES: Regex = Regex::new(concat!(
        "INFO: lockdep is turned off|INFO: Stall ended before state dump start",
        "|WARNING: /etc/ssh/moduli does not exist|WARNING: Unprivileged eBPF",
        "|INFO: NMI handler .* took too long to run",
    ))
    .unwrap();
    static ref OFFSET: Regex = Regex::new(r"\+0x[0-9a-f]+/0x[0-9a-f]+").unwrap();
}

const MAX_TITLE_LEN: usize = 120;

#[derive(Debug, Default, Clone)]
pub struct LinuxReporter;

impl LinuxReporter {
    pub fn new() -> Self {
        LinuxReporter
    }

    /// Line start and marker start of the first oops in `output`.
    fn find_oops(&self, output: &[u8]) -> Option<(usize, usize)> {
        for m in OOPS.find_iter(output) {
            let line_start = line_start(output, m.start());
            let line = &output[line_start..line_end(output, m.start())];
            if IGNORES.is_match(line) {
                continue;
            }
            return Some((line_start, m.start()));
        }
        None
    }
}

fn line_start(output: &[u8], pos: usize) -> usize {
    output[..pos]
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |i| i + 1)
}

fn line_end(output: &[u8], pos: usize) -> usize {
    output[pos..]
        .iter()
        .position(|&b| b == b'\n')
        .map_or(output.len(), |i| pos + i)
}

/// Title is the marker line without console prefix and code offsets.
fn title(line: &[u8]) -> String {
    let line = OFFSET.replace_all(line, &b""[..]);
    let mut title = String::from_utf8_lossy(&line).trim().to_string();
    if title.len() > MAX_TITLE_LEN {
        let mut end = MAX_TITLE_LEN;
        while !title.is_char_boundary(end) {
            end -= 1;
        }
        title.truncate(end);
    }
    title
}

impl Reporter for LinuxReporter {
    fn find_crash(&self, output: &[u8]) -> Option<usize> {
        self.find_oops(output).map(|(line_start, _)| line_start)
    }

    fn extract(&self, output: &[u8]) -> Option<Extracted> {
        let (line_start, marker) = self.find_oops(output)?;
        let title = title(&output[marker..line_end(output, marker)]);
        if title.is_empty() {
            return None;
        }
        Some(Extracted {
            title,
            report: output[line_start..].to_vec(),
        })
    }
}
