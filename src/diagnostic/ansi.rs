//! Terminal renderer. Colors are plain ANSI escapes, suppressed when the
//! caller asks for none (the CLI checks NO_COLOR).

use super::{Diagnostic, Severity};

const RED: &str = "\x1b[31;1m";
const YELLOW: &str = "\x1b[33;1m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

pub fn render(d: &Diagnostic, color: bool) -> String {
    let mut out = String::new();

    let (tint, label) = match d.severity {
        Severity::Error => (RED, "error"),
        Severity::Warning => (YELLOW, "warning"),
    };
    if color {
        out.push_str(&format!("{}{}{}: {}{}{}\n", tint, label, RESET, BOLD, d.message, RESET));
    } else {
        out.push_str(&format!("{}: {}\n", label, d.message));
    }

    if let (Some(file), Some(line)) = (&d.file, d.line) {
        out.push_str(&format!("  --> {}:{}\n", file, line));
    }
    for entry in &d.trace {
        if color {
            out.push_str(&format!("  {}{}{}\n", DIM, entry, RESET));
        } else {
            out.push_str(&format!("  {}\n", entry));
        }
    }
    for note in &d.notes {
        out.push_str(&format!("  note: {}\n", note));
    }

    out
}
