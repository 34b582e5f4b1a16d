//! Flat log records and the single-line template shared by the converter and
//! the session window.

use serde::Deserialize;
use serde::Serialize;

/// One structured log row. Every field is free text; nothing is validated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub date: String,
    pub time: String,
    pub pid: String,
    pub level: String,
    pub component: String,
    pub content: String,
}

impl LogRecord {
    /// Render the record as `"{date} {time} {pid} {level} {component}: {content}"`.
    pub fn render(&self) -> String {
        format!(
            "{} {} {} {} {}: {}",
            self.date, self.time, self.pid, self.level, self.component, self.content
        )
    }

    /// Inverse of [`LogRecord::render`].
    ///
    /// The first four fields are split on single spaces and the component ends
    /// at the first `": "`, so a record round-trips exactly as long as none of
    /// those fields contain the separator they are split on.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let line = line.strip_suffix('\r').unwrap_or(line);

        let mut head = line.splitn(5, ' ');
        let date = head.next()?;
        let time = head.next()?;
        let pid = head.next()?;
        let level = head.next()?;
        let rest = head.next()?;

        let (component, content) = match rest.split_once(": ") {
            Some(parts) => parts,
            None => (rest.strip_suffix(':')?, ""),
        };

        Some(Self {
            date: date.to_string(),
            time: time.to_string(),
            pid: pid.to_string(),
            level: level.to_string(),
            component: component.to_string(),
            content: content.to_string(),
        })
    }
}

/// Text value of a source cell. Missing cells and the literal `nan` that
/// dataframe exports write for missing values both become the empty string.
pub fn coerce_text(raw: Option<&str>) -> String {
    match raw {
        Some(value) if value != "nan" => value.to_string(),
        _ => String::new(),
    }
}
