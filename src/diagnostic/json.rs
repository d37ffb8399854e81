//! Machine-readable renderer: one JSON object per diagnostic (NDJSON).

use super::Diagnostic;
use serde_json::json;

pub fn render(d: &Diagnostic) -> String {
    json!({
        "severity": d.severity.label(),
        "message": d.message,
        "file": d.file,
        "line": d.line,
        "notes": d.notes,
        "trace": d.trace,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_parseable_json() {
        let d = Diagnostic::error("nope").with_location("m.sk", 7);
        let v: serde_json::Value = serde_json::from_str(&render(&d)).unwrap();
        assert_eq!(v["severity"], "error");
        assert_eq!(v["message"], "nope");
        assert_eq!(v["file"], "m.sk");
        assert_eq!(v["line"], 7);
    }

    #[test]
    fn null_location_serializes_as_null() {
        let d = Diagnostic::error("runtime-ish");
        let v: serde_json::Value = serde_json::from_str(&render(&d)).unwrap();
        assert!(v["file"].is_null());
        assert!(v["line"].is_null());
    }
}
