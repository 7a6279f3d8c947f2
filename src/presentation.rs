use parking_lot::Mutex;
use std::io::Write;
use tracing::{error, info};

use crate::decision::DisplayDecision;

/// Surface that receives loop output. Always available once the loop runs.
pub trait PresentationSink: Send + Sync {
    fn show_status(&self, message: &str, is_error: bool);

    fn show_decision(&self, decision: &DisplayDecision);
}

/// One-line rendering of a decision: confidence, name, then diagram or warning.
pub fn render_decision(decision: &DisplayDecision) -> String {
    let detail = match (&decision.diagram, &decision.warning) {
        (_, Some(warning)) => format!("⚠ {}", warning),
        (Some(diagram), None) => format!("diagram: {}", diagram),
        (None, None) => String::new(),
    };
    format!(
        "[{:>6}] {} | {}",
        decision.confidence_readout(),
        decision.shown_name,
        detail
    )
}

/// Terminal surface: statuses on their own lines, the live decision redrawn in place.
pub struct ConsoleSink {
    last_status: Mutex<Option<String>>,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self {
            last_status: Mutex::new(None),
        }
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new()
    }
}

impl PresentationSink for ConsoleSink {
    fn show_status(&self, message: &str, is_error: bool) {
        if is_error {
            error!("{}", message);
        } else {
            info!("{}", message);
        }

        // Repeated "detected" statuses every cycle would flood the terminal
        let mut last = self.last_status.lock();
        if last.as_deref() == Some(message) {
            return;
        }
        *last = Some(message.to_string());

        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout, "\r\x1b[2K{}", message);
        let _ = stdout.flush();
    }

    fn show_decision(&self, decision: &DisplayDecision) {
        let mut stdout = std::io::stdout().lock();
        let _ = write!(stdout, "\r\x1b[2K{}", render_decision(decision));
        let _ = stdout.flush();
    }
}
