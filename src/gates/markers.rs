//! Parsing of ambiguity markers in stage output.
//!
//! A stage flags an ambiguity with a line of the form
//!
//! ```text
//! DECISION_REQUIRED: <axis>
//! DECISION_REQUIRED: <axis>: <option> | <option>
//! ```
//!
//! Options given on the marker line are informational; the declared option
//! set for the axis is authoritative.

use regex::Regex;
use std::sync::LazyLock;

static MARKER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*DECISION_REQUIRED:[ \t]*(.*?)[ \t]*$").unwrap());

/// An ambiguity flagged by stage output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub axis: String,
    pub options: Vec<String>,
}

/// Extract markers in order of appearance, one per axis.
pub fn parse_markers(text: &str) -> Vec<Marker> {
    let mut markers: Vec<Marker> = Vec::new();
    for cap in MARKER_REGEX.captures_iter(text) {
        let body = cap.get(1).map(|m| m.as_str()).unwrap_or_default();
        let (axis, options) = match body.split_once(':') {
            Some((axis, rest)) => (axis.trim(), split_options(rest)),
            None => (body.trim(), Vec::new()),
        };
        if markers.iter().any(|m| m.axis == axis) {
            continue;
        }
        markers.push(Marker {
            axis: axis.to_string(),
            options,
        });
    }
    markers
}

fn split_options(rest: &str) -> Vec<String> {
    rest.split('|')
        .map(|o| o.trim())
        .filter(|o| !o.is_empty())
        .map(String::from)
        .collect()
}

/// Remove marker lines, leaving the rest of the output intact.
pub fn strip_markers(text: &str) -> String {
    let stripped = MARKER_REGEX.replace_all(text, "");
    let mut out = String::with_capacity(stripped.len());
    let mut blank_run = 0;
    for line in stripped.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim_end().to_string()
}
