use crate::vm::Instance;

/// Diagnose command of one run, fires at most once.
pub struct Diagnoser<'a, I: ?Sized> {
    inst: &'a I,
    fired: bool,
    /// What the diagnose command wrote into the output stream so far.
    output: Vec<u8>,
}

impl<'a, I: Instance + ?Sized> Diagnoser<'a, I> {
    pub fn new(inst: &'a I) -> Self {
        Self {
            inst,
            fired: false,
            output: Vec::new(),
        }
    }

    /// Fires unless it already did, returns whether this call fired it.
    pub fn fire(&mut self) -> bool {
        if self.fired {
            return false;
        }
        self.fired = true;
        if !self.inst.diagnose() {
            log::debug!("diagnose: nothing issued");
        }
        true
    }

    pub fn fired(&self) -> bool {
        self.fired
    }

    pub fn record(&mut self, data: &[u8]) {
        self.output.extend_from_slice(data);
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{Execution, InstanceError, Stop};
    use std::{
        path::{Path, PathBuf},
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    #[derive(Default)]
    struct Counting(AtomicUsize);

    impl Instance for Counting {
        fn run(
            &mut self,
            _: Duration,
            _: Option<Stop>,
            _: &str,
        ) -> Result<Execution, InstanceError> {
            Err(InstanceError::Closed)
        }

        fn diagnose(&self) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            false
        }

        fn copy(&mut self, p: &Path) -> Result<PathBuf, InstanceError> {
            Ok(p.to_path_buf())
        }

        fn forward(&mut self, port: u16) -> Result<String, InstanceError> {
            Ok(port.to_string())
        }

        fn close(&mut self) {}
    }

    #[test]
    fn fires_once() {
        let inst = Counting::default();
        let mut diag = Diagnoser::new(&inst);
        assert!(!diag.fired());
        assert!(diag.fire());
        assert!(!diag.fire());
        assert!(diag.fired());
        // a failed diagnose still counts as fired.
        assert_eq!(inst.0.load(Ordering::SeqCst), 1);

        diag.record(b"DIAG");
        diag.record(b"NOSE\n");
        assert_eq!(diag.output(), b"DIAGNOSE\n");
    }
}
