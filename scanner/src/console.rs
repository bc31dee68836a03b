//! Terminal presentation: renders scan events and parses typed commands.

use qr_guard_common::event::{ScanEvent, ScanFailure};
use std::fmt::Write;
use std::path::PathBuf;

use crate::sink::ResultView;

const SAFE_TIPS: &[&str] = &[
    "No threats were found for this URL",
    "Keep following your usual browsing precautions",
    "Be careful whenever a site asks for personal information",
];

const DANGER_TIPS: &[&str] = &[
    "This URL has been identified as dangerous",
    "Do not open it",
    "Do not enter personal or financial information",
    "Warn others who may have received the same code",
];

const FAILURE_TIPS: &[&str] = &[
    "Check your network connection",
    "Try again in a moment",
    "If the problem persists, contact the administrator",
];

/// A line typed by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Camera,
    Stop,
    Restart,
    Retry,
    File(PathBuf),
    Dismiss,
    Details,
    Help,
    Quit,
}

pub fn parse_input(line: &str) -> Result<Input, String> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((w, r)) => (w, r.trim()),
        None => (line, ""),
    };
    match word.to_ascii_lowercase().as_str() {
        "camera" | "start" => Ok(Input::Camera),
        "stop" => Ok(Input::Stop),
        "restart" | "rescan" => Ok(Input::Restart),
        "retry" => Ok(Input::Retry),
        "file" | "upload" if !rest.is_empty() => Ok(Input::File(PathBuf::from(rest))),
        "file" | "upload" => Err("usage: file <path>".into()),
        "dismiss" | "close" => Ok(Input::Dismiss),
        "details" => Ok(Input::Details),
        "help" | "?" => Ok(Input::Help),
        "quit" | "exit" => Ok(Input::Quit),
        "" => Err("empty command".into()),
        other => Err(format!("unknown command '{other}', type 'help'")),
    }
}

pub const HELP: &str = "commands: camera | stop | restart | retry | file <path> | dismiss | details | quit";

/// Keeps the result view and turns accepted events into printable text.
#[derive(Debug, Default)]
pub struct Console {
    view: ResultView,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an event; `None` when it was discarded as stale.
    pub fn show(&mut self, event: ScanEvent) -> Option<String> {
        let text = render(&event);
        let stamp = chrono::Local::now().format("%H:%M:%S");
        self.view.apply(event).then(|| format!("[{stamp}] {text}"))
    }

    pub fn dismiss(&mut self) {
        self.view.dismiss();
    }

    pub fn clear_camera_error(&mut self) {
        self.view.clear_camera_error();
    }

    /// Pretty-printed API response behind the verdict on screen.
    pub fn details(&self) -> Option<String> {
        match self.view.current()? {
            ScanEvent::Verdict { verdict, .. } => serde_json::to_string_pretty(&verdict.raw).ok(),
            _ => None,
        }
    }
}

fn tips(out: &mut String, tips: &[&str]) {
    for tip in tips {
        let _ = writeln!(out, "  - {tip}");
    }
}

pub fn render(event: &ScanEvent) -> String {
    let mut out = String::new();
    match event {
        ScanEvent::Loading { payload, .. } => {
            let _ = writeln!(out, "Checking the safety of {payload} ...");
        }
        ScanEvent::Verdict {
            payload, verdict, ..
        } if verdict.is_safe => {
            let _ = writeln!(out, "[SAFE] {payload}");
            let _ = writeln!(out, "  This URL was checked and found safe.");
            tips(&mut out, SAFE_TIPS);
            let _ = writeln!(out, "  Visit: {payload}");
        }
        ScanEvent::Verdict {
            payload, verdict, ..
        } => {
            let _ = writeln!(out, "[DANGER] {payload}");
            let _ = writeln!(out, "  {}", verdict.threat.description());
            tips(&mut out, DANGER_TIPS);
        }
        ScanEvent::Error {
            payload: Some(payload),
            error: ScanFailure::Verification(e),
            ..
        } => {
            let _ = writeln!(out, "[CHECK FAILED] {payload}");
            let _ = writeln!(out, "  {e}");
            tips(&mut out, FAILURE_TIPS);
            let _ = writeln!(out, "  Type 'restart' to scan again.");
        }
        ScanEvent::Error { error, .. } => {
            let _ = writeln!(out, "Could not scan: {error}");
        }
        ScanEvent::CameraError { error, .. } => {
            let _ = writeln!(out, "Camera unavailable: {error} ({}).", error.hint());
            let _ = writeln!(out, "  Type 'retry' to try again.");
        }
    }
    out
}
