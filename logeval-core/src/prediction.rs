use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

static LABEL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)normal|anomalous").expect("label pattern is valid"));

/// Label read out of generated text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionLabel {
    Anomalous,
    Normal,
    /// Neither keyword appeared. Scored as normal.
    Unparsed,
}

impl PredictionLabel {
    pub fn is_positive(self) -> bool {
        self == Self::Anomalous
    }

    pub fn as_binary(self) -> u8 {
        u8::from(self.is_positive())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anomalous => "anomalous",
            Self::Normal => "normal",
            Self::Unparsed => "unparsed",
        }
    }
}

impl fmt::Display for PredictionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First case-insensitive occurrence of `normal` or `anomalous` decides.
/// Substrings count, so `abnormal` reads as normal.
pub fn parse_prediction(text: &str) -> PredictionLabel {
    match LABEL_PATTERN.find(text) {
        Some(found) if found.as_str().eq_ignore_ascii_case("anomalous") => {
            PredictionLabel::Anomalous
        }
        Some(_) => PredictionLabel::Normal,
        None => PredictionLabel::Unparsed,
    }
}
