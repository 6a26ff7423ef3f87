// The normalized event record and its attribute merging rules

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Event source category; serializes to lowercase JSON (e.g. "interface").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Container,
    Interface,
    Traffic,
    /// Runtime event types other than containers (network, volume, ...), kept verbatim.
    Other(String),
}

impl EventKind {
    /// Parse from a runtime type string, case-insensitive.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "container" => EventKind::Container,
            "interface" => EventKind::Interface,
            "traffic" => EventKind::Traffic,
            other => EventKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Container => "container",
            EventKind::Interface => "interface",
            EventKind::Traffic => "traffic",
            EventKind::Other(s) => s,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One emitted fact. Built once by a producer, moved through the channel, consumed by the formatter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub action: String,
    pub actor_id: String,
    pub actor_name: String,
    pub actor_full_id: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl AggregatedEvent {
    /// New event stamped with the current time; the action is lower-cased.
    pub fn new(kind: EventKind, action: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            action: action.to_lowercase(),
            actor_id: String::new(),
            actor_name: String::new(),
            actor_full_id: String::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Sets the actor triple. `actor_id` is derived from `full_id` when `short` is empty.
    pub fn actor(mut self, short: &str, name: &str, full_id: &str) -> Self {
        let short = if short.is_empty() { full_id } else { short };
        self.actor_id = short_id(short).to_string();
        self.actor_name = name.to_string();
        self.actor_full_id = full_id.to_string();
        self
    }

    pub fn attributes<I, K, V>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.attributes
            .extend(attributes.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Attributes as presented to consumers: empty values dropped, `name` and `id`
    /// folded in from the actor. Empty when there is nothing to show.
    pub fn merged_attributes(&self) -> BTreeMap<String, String> {
        let mut attrs: BTreeMap<String, String> = self
            .attributes
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if !self.actor_name.is_empty() {
            attrs.insert("name".to_string(), self.actor_name.clone());
        }
        if !self.actor_full_id.is_empty() {
            attrs.insert("id".to_string(), self.actor_full_id.clone());
        }
        attrs
    }
}

/// First 12 characters of a container id.
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(12) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}
