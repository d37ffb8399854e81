pub mod ansi;
pub mod json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    #[allow(dead_code)] // forward infrastructure for warning diagnostics
    Warning,
}

impl Severity {
    pub fn label(self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
        }
    }
}

/// A renderable report of something that went wrong: message, source
/// location when one exists, and the symbolic call trace for runtime
/// failures.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub notes: Vec<String>,
    pub trace: Vec<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            message: message.into(),
            file: None,
            line: None,
            notes: Vec::new(),
            trace: Vec::new(),
        }
    }

    pub fn with_location(mut self, file: impl Into<String>, line: u32) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }
}

// ---- From impls for the error families ----

impl From<&crate::compiler::CompileError> for Diagnostic {
    fn from(e: &crate::compiler::CompileError) -> Self {
        Diagnostic::error(&e.message).with_location(&e.file, e.line)
    }
}

impl From<&crate::vm::RuntimeError> for Diagnostic {
    fn from(e: &crate::vm::RuntimeError) -> Self {
        // the VM folds the symbolic trace into the message, one
        // "  at ..." line per frame; split it back out for rendering
        let mut lines = e.message.lines();
        let message = lines.next().unwrap_or_default().to_string();
        let trace: Vec<String> = lines.map(|l| l.trim_start().to_string()).collect();
        let mut d = Diagnostic::error(message);
        d.trace = trace;
        if let Some(ip) = e.ip {
            d = d.with_note(format!("raised at instruction {}", ip));
        }
        d
    }
}

impl From<&crate::Error> for Diagnostic {
    fn from(e: &crate::Error) -> Self {
        match e {
            crate::Error::Compile(e) => Diagnostic::from(e),
            crate::Error::Runtime(e) => Diagnostic::from(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_builder() {
        let d = Diagnostic::error("something broke")
            .with_location("main.sk", 12)
            .with_note("while assembling");
        assert_eq!(d.severity, Severity::Error);
        assert_eq!(d.file.as_deref(), Some("main.sk"));
        assert_eq!(d.line, Some(12));
        assert_eq!(d.notes, vec!["while assembling"]);
    }

    #[test]
    fn from_compile_error() {
        let e = crate::compiler::CompileError {
            file: "script.sk".into(),
            line: 3,
            message: "too many locals: over 256 locals in function".into(),
        };
        let d = Diagnostic::from(&e);
        assert!(d.message.contains("locals"));
        assert_eq!(d.file.as_deref(), Some("script.sk"));
        assert_eq!(d.line, Some(3));
    }

    #[test]
    fn from_runtime_error_splits_trace() {
        let e = crate::vm::RuntimeError {
            message: "division by zero\n  at boom#0 (script.sk:2)\n  at __main (script.sk:4)"
                .into(),
            ip: Some(17),
        };
        let d = Diagnostic::from(&e);
        assert_eq!(d.message, "division by zero");
        assert_eq!(d.trace.len(), 2);
        assert!(d.trace[0].contains("boom"));
        assert!(d.notes.iter().any(|n| n.contains("17")));
    }
}
