//! Placeholder substitution for trigger title/description templates.
//!
//! Recognized tokens: `{{date}}`, `{{time}}`, `{{datetime}}`.
//! Anything else, including unknown `{{...}}` tokens, is copied verbatim.

use chrono::{DateTime, FixedOffset, SecondsFormat};

/// Render `template` against `now`.
pub fn render_template(template: &str, now: &DateTime<FixedOffset>) -> String {
    if !template.contains("{{") {
        return template.to_string();
    }
    template
        .replace("{{datetime}}", &now.to_rfc3339_opts(SecondsFormat::Millis, false))
        .replace("{{date}}", &now.format("%Y-%m-%d").to_string())
        .replace("{{time}}", &now.format("%H:%M:%S").to_string())
}
