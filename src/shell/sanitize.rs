//! Display normalization for remote shell output.
//!
//! Everything the sentinel decoder classifies as text still carries
//! terminal noise: color codes, carriage-return progress bars, and
//! compiler diagnostics jammed onto one line. `sanitize` cleans that up
//! for presentation and is idempotent, so callers may re-sanitize
//! accumulated output freely.

use regex::Regex;
use std::sync::OnceLock;

/// Normalize shell output for display: strip remaining control/color
/// sequences, normalize line endings, collapse blank-line runs, trim
/// each line, and start a fresh line before diagnostic keywords that
/// got glued mid-line. `sanitize(sanitize(x)) == sanitize(x)`.
#[must_use]
pub fn sanitize(text: &str) -> String {
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let text = control_codes_regex().replace_all(&text, "");
    let text = keyword_break_regex().replace_all(&text, "\n$1");
    let lines: Vec<&str> = text.lines().map(str::trim).collect();
    let joined = lines.join("\n");
    let collapsed = blank_runs_regex().replace_all(&joined, "\n\n");
    collapsed.trim().to_string()
}

fn control_codes_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // CSI sequences, OSC sequences, two-byte escapes, then any
        // stray C0 control characters other than newline and tab.
        Regex::new(
            r"(?x)
            \x1b \[ [0-9;?]* [\x20-\x2f]* [@-~]
            | \x1b \] [^\x07\x1b]* (?: \x07 | \x1b \\ )?
            | \x1b [@-Z\\^_]
            | [\x00-\x08\x0b\x0c\x0e-\x1f\x7f]
            ",
        )
        .expect("control code regex should compile")
    })
}

fn keyword_break_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Requiring preceding whitespace keeps path-like substrings
        // (`src/error:12`) intact, and makes a second pass a no-op
        // because the inserted newline is no longer matched.
        Regex::new(
            r"(?x)
            [\ \t]+
            (
                (?i: error | warning) \s? :
                | npm \ ERR!
                | at \ [\w$.<>\[\]/-]+ \ \( [^()\n]* : [0-9]+ : [0-9]+ \)
            )
            ",
        )
        .expect("keyword break regex should compile")
    })
}

fn blank_runs_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n{3,}").expect("blank run regex should compile"))
}
