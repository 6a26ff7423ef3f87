// Renders events as plain text lines or newline-delimited JSON

use crate::error::EventsError;
use crate::models::AggregatedEvent;
use chrono::SecondsFormat;
use std::io::{self, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Formatter {
    Plain,
    Json,
}

impl Formatter {
    /// Case-insensitive; an empty name means plain.
    pub fn from_name(name: &str) -> Result<Self, EventsError> {
        match name.trim().to_lowercase().as_str() {
            "" | "plain" => Ok(Formatter::Plain),
            "json" => Ok(Formatter::Json),
            _ => Err(EventsError::UnsupportedFormat(name.to_string())),
        }
    }

    /// Writes one event as one line.
    pub fn write<W: Write + ?Sized>(&self, w: &mut W, ev: &AggregatedEvent) -> io::Result<()> {
        match self {
            Formatter::Plain => writeln!(w, "{}", plain_line(ev)),
            Formatter::Json => {
                let mut view = ev.clone();
                view.attributes = ev.merged_attributes();
                serde_json::to_writer(&mut *w, &view)?;
                w.write_all(b"\n")
            }
        }
    }
}

fn plain_line(ev: &AggregatedEvent) -> String {
    let actor = [&ev.actor_full_id, &ev.actor_id, &ev.actor_name]
        .into_iter()
        .find(|s| !s.is_empty())
        .map(String::as_str)
        .unwrap_or("-");
    let ts = ev.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true);

    let attrs = ev.merged_attributes();
    let suffix = if attrs.is_empty() {
        String::new()
    } else {
        let parts: Vec<String> = attrs.iter().map(|(k, v)| format!("{k}={v}")).collect();
        format!(" ({})", parts.join(", "))
    };
    format!("{ts} {} {} {actor}{suffix}", ev.kind, ev.action)
}
