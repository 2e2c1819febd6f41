//! Status surface toward the shell.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusColor {
    Default,
    Green,
    Yellow,
    Red,
    Gray,
}

/// One line of shell output with its styling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub text: String,
    pub bold: bool,
    pub italic: bool,
    pub color: StatusColor,
    pub point_size: u8,
}

impl StatusMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            bold: false,
            italic: false,
            color: StatusColor::Default,
            point_size: 10,
        }
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self::new(text)
    }

    pub fn success(text: impl Into<String>) -> Self {
        Self {
            bold: true,
            color: StatusColor::Green,
            ..Self::new(text)
        }
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self {
            color: StatusColor::Yellow,
            ..Self::new(text)
        }
    }

    pub fn fault(text: impl Into<String>) -> Self {
        Self {
            bold: true,
            color: StatusColor::Red,
            point_size: 12,
            ..Self::new(text)
        }
    }

    pub fn dropped(text: impl Into<String>) -> Self {
        Self {
            italic: true,
            color: StatusColor::Gray,
            ..Self::new(text)
        }
    }
}

/// Receives `Display(...)` calls from the core.
pub trait StatusSink: Send + Sync {
    fn display(&self, message: &StatusMessage);
}

/// Routes status lines into the log.
pub struct LogSink;

impl StatusSink for LogSink {
    fn display(&self, message: &StatusMessage) {
        match message.color {
            StatusColor::Red => log::error!("{}", message.text),
            StatusColor::Yellow => log::warn!("{}", message.text),
            StatusColor::Gray => log::debug!("{}", message.text),
            _ => log::info!("{}", message.text),
        }
    }
}

/// Prints status lines to stdout with ANSI styling.
pub struct ConsoleSink {
    color: bool,
}

impl ConsoleSink {
    pub fn new(color: bool) -> Self {
        Self { color }
    }

    fn render(&self, message: &StatusMessage) -> String {
        if !self.color {
            return message.text.clone();
        }

        let mut codes = Vec::new();
        if message.bold {
            codes.push("1");
        }
        if message.italic {
            codes.push("3");
        }
        match message.color {
            StatusColor::Green => codes.push("32"),
            StatusColor::Yellow => codes.push("33"),
            StatusColor::Red => codes.push("31"),
            StatusColor::Gray => codes.push("90"),
            StatusColor::Default => {}
        }

        if codes.is_empty() {
            message.text.clone()
        } else {
            format!("\x1b[{}m{}\x1b[0m", codes.join(";"), message.text)
        }
    }
}

impl StatusSink for ConsoleSink {
    fn display(&self, message: &StatusMessage) {
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{}", self.render(message)) {
            log::warn!("Failed to write status line: {e}");
        }
    }
}

/// Keeps every message; used by tests and the JSON report.
#[derive(Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<StatusMessage>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<StatusMessage> {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.messages().iter().any(|m| m.text.contains(needle))
    }
}

impl StatusSink for RecordingSink {
    fn display(&self, message: &StatusMessage) {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(message.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_render() {
        let plain = ConsoleSink::new(false);
        assert_eq!(plain.render(&StatusMessage::fault("boom")), "boom");

        let styled = ConsoleSink::new(true);
        assert_eq!(styled.render(&StatusMessage::fault("boom")), "\x1b[1;31mboom\x1b[0m");
        assert_eq!(styled.render(&StatusMessage::info("hi")), "hi");
        assert_eq!(styled.render(&StatusMessage::dropped("x")), "\x1b[3;90mx\x1b[0m");
    }

    #[test]
    fn test_recording_sink() {
        let sink = RecordingSink::new();
        sink.display(&StatusMessage::success("Filtering started"));
        assert!(sink.contains("started"));
        assert_eq!(sink.messages()[0].color, StatusColor::Green);
    }
}
