//! Segment-template identifier substitution.
//!
//! DASH templates carry `$RepresentationID$`, `$Number$`, `$Time$` and
//! `$Bandwidth$` placeholders, optionally with a `%0[width]d` padding
//! specifier. Only `%0[width]d` is permitted by the profile, so substitution
//! is plain string replacement rather than a printf reimplementation.

use std::sync::LazyLock;

use regex::{Captures, Regex};

static IDENTIFIER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(RepresentationID|Number|Time|Bandwidth)(?:%0(\d+)d)?\$").unwrap()
});

/// Values substituted into one segment-template expansion.
///
/// Unset identifiers are left verbatim in the output so a malformed template
/// is visible in the resulting name instead of silently collapsing.
#[derive(Debug, Default, Clone)]
pub struct TemplateVars {
    pub representation_id: Option<String>,
    pub number: Option<u64>,
    pub time: Option<u64>,
    pub bandwidth: Option<u64>,
}

impl TemplateVars {
    /// Vars for a media-segment expansion.
    pub fn for_segment(representation_id: &str, number: u64, bandwidth: Option<u64>) -> Self {
        Self {
            representation_id: Some(representation_id.to_string()),
            number: Some(number),
            time: Some(number),
            bandwidth,
        }
    }

    /// Vars for an initialization-segment expansion. `$Number$` and `$Time$`
    /// are not valid in initialization templates and stay unset.
    pub fn for_init(representation_id: &str, bandwidth: Option<u64>) -> Self {
        Self {
            representation_id: Some(representation_id.to_string()),
            bandwidth,
            ..Self::default()
        }
    }

    fn lookup(&self, identifier: &str) -> Option<String> {
        match identifier {
            "RepresentationID" => self.representation_id.clone(),
            "Number" => self.number.map(|n| n.to_string()),
            "Time" => self.time.map(|t| t.to_string()),
            "Bandwidth" => self.bandwidth.map(|b| b.to_string()),
            _ => None,
        }
    }
}

/// Expands every known identifier in `pattern` with the given vars.
pub fn resolve(pattern: &str, vars: &TemplateVars) -> String {
    IDENTIFIER_REGEX
        .replace_all(pattern, |caps: &Captures<'_>| {
            let identifier = &caps[1];
            let Some(value) = vars.lookup(identifier) else {
                return caps[0].to_string();
            };
            match caps.get(2) {
                Some(width) => {
                    let width: usize = width.as_str().parse().unwrap_or(0);
                    format!("{value:0>width$}")
                }
                None => value,
            }
        })
        .to_string()
}
