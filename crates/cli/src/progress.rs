use std::io::Write;
use std::sync::Mutex;

use installer_core::Progress;

/// Line-oriented terminal output. Failures go to stderr.
#[derive(Default)]
pub struct TermProgress {
    // Keeps lines from concurrent components from interleaving.
    out: Mutex<()>,
}

impl TermProgress {
    fn line(&self, stderr: bool, prefix: &str, msg: &str) {
        let _guard = self.out.lock().unwrap_or_else(|p| p.into_inner());
        if stderr {
            let _ = writeln!(std::io::stderr().lock(), "{} {}", prefix, msg);
        } else {
            let _ = writeln!(std::io::stdout().lock(), "{} {}", prefix, msg);
        }
    }
}

impl Progress for TermProgress {
    fn note(&self, msg: &str) {
        self.line(false, "  ..", msg);
    }

    fn success(&self, msg: &str) {
        self.line(false, "  ok", msg);
    }

    fn failure(&self, msg: &str) {
        self.line(true, "  !!", msg);
    }
}
