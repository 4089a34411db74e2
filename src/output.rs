//! Operator-facing output
//!
//! Observable lines are timestamped and colorised: green for success,
//! yellow for warnings, red for errors. Internal diagnostics go through
//! `tracing` instead. The process-wide verbosity (0..=2) lives here so
//! the send path and the inbound dispatch can read it cheaply.

use std::fmt::Display;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crossterm::style::Stylize;

pub const MAX_VERBOSITY: u8 = 2;

/// Shared handle for operator output and the verbosity flag.
#[derive(Clone, Default)]
pub struct Output {
    verbose: Arc<AtomicU8>,
}

impl Output {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn verbosity(&self) -> u8 {
        self.verbose.load(Ordering::Relaxed)
    }

    pub fn set_verbosity(&self, level: u8) {
        self.verbose.store(level.min(MAX_VERBOSITY), Ordering::Relaxed);
    }

    fn stamp(&self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        format!("{}.{:03}: ", now.as_secs(), now.subsec_millis())
    }

    pub fn line(&self, msg: impl Display) {
        println!("{}{}", self.stamp(), msg);
    }

    pub fn success(&self, msg: impl Display) {
        println!("{}{}", self.stamp(), msg.to_string().green());
    }

    pub fn warning(&self, msg: impl Display) {
        println!("{}{}{}", self.stamp(), "Warning: ".yellow(), msg);
    }

    pub fn error(&self, msg: impl Display) {
        println!("{}{}{}", self.stamp(), "Error: ".red(), msg);
    }
}

/// Vehicle-prefixed report line: the name right-aligned to 12 columns.
pub fn tagged(name: &str, msg: impl Display) -> String {
    format!("{:>12}: {}", name, msg)
}
