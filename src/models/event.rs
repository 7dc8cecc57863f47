// Broker events and subscription options

//! # Events
//!
//! An [`Event`] is a named notification carrying a JSON payload. Subscribers
//! register against an [`EventKey`] (an exact name or a regular expression) and
//! narrow what they receive with [`SubscribeOptions`]. Publishers describe the
//! event's provenance with [`PublishOptions`].

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// A published notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    /// Where the event came from, e.g. `"worker"` for forwarded events.
    pub origin: Option<String>,
    /// Hex digest a privileged subscriber compares against its own secret.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub privileged_token: Option<String>,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: Value, options: &PublishOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            timestamp: Utc::now(),
            payload,
            origin: options.origin.clone(),
            privileged_token: options.privileged_token.clone(),
        }
    }
}

/// What a subscription listens to.
#[derive(Debug, Clone)]
pub enum EventKey {
    /// Matches exactly one event name
    Name(String),
    /// Matches every event name the expression matches
    Pattern(Regex),
}

impl EventKey {
    /// The string the subscription is filed under.
    pub fn as_str(&self) -> &str {
        match self {
            EventKey::Name(name) => name,
            EventKey::Pattern(regex) => regex.as_str(),
        }
    }

    pub fn is_pattern(&self) -> bool {
        matches!(self, EventKey::Pattern(_))
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKey::Name(name) => write!(f, "{name}"),
            EventKey::Pattern(regex) => write!(f, "/{}/", regex.as_str()),
        }
    }
}

impl From<&str> for EventKey {
    fn from(name: &str) -> Self {
        EventKey::Name(name.to_string())
    }
}

impl From<String> for EventKey {
    fn from(name: String) -> Self {
        EventKey::Name(name)
    }
}

impl From<&String> for EventKey {
    fn from(name: &String) -> Self {
        EventKey::Name(name.clone())
    }
}

impl From<Regex> for EventKey {
    fn from(regex: Regex) -> Self {
        EventKey::Pattern(regex)
    }
}

/// Flags set by the publisher.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Skip pattern subscriptions when an exact-name subscription matched.
    pub regex_off: bool,
    pub origin: Option<String>,
    pub privileged_token: Option<String>,
}

impl PublishOptions {
    pub fn from_origin(origin: impl Into<String>) -> Self {
        Self {
            origin: Some(origin.into()),
            ..Self::default()
        }
    }

    pub fn regex_off(mut self) -> Self {
        self.regex_off = true;
        self
    }

    pub fn privileged(mut self, token: impl Into<String>) -> Self {
        self.privileged_token = Some(token.into());
        self
    }
}

/// Custom acceptance test for a subscription.
pub type EventPredicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Unique handle for one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Flags set by the subscriber. All checks are combined with AND.
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    /// Remove the subscription after its first delivery.
    pub once: bool,
    /// Run the handler this long after the event instead of inline.
    pub delay: Duration,
    /// Every key must be present in the payload with an equal value.
    pub filter: Map<String, Value>,
    /// Event names this subscription never receives.
    pub ignore: Vec<String>,
    /// At most one handler may be registered for the key.
    pub singleton: bool,
    /// Only events carrying the hash of this secret are delivered.
    pub privileged: Option<String>,
    pub predicate: Option<EventPredicate>,
    /// Origins allowed through. `None` admits every origin.
    pub enabled_origins: Option<Vec<String>>,
    /// Origins that are always rejected.
    pub disabled_origins: Vec<String>,
}

impl fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("once", &self.once)
            .field("delay", &self.delay)
            .field("filter", &self.filter)
            .field("ignore", &self.ignore)
            .field("singleton", &self.singleton)
            .field("privileged", &self.privileged.is_some())
            .field("predicate", &self.predicate.is_some())
            .field("enabled_origins", &self.enabled_origins)
            .field("disabled_origins", &self.disabled_origins)
            .finish()
    }
}

impl SubscribeOptions {
    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    pub fn singleton(mut self) -> Self {
        self.singleton = true;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn filter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.filter.insert(key.into(), value);
        self
    }

    pub fn ignore(mut self, event_name: impl Into<String>) -> Self {
        self.ignore.push(event_name.into());
        self
    }

    pub fn privileged(mut self, secret: impl Into<String>) -> Self {
        self.privileged = Some(secret.into());
        self
    }

    pub fn predicate(mut self, predicate: impl Fn(&Event) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Only accept events from `origin` (case-insensitive). May be called repeatedly.
    pub fn from_origin(mut self, origin: impl Into<String>) -> Self {
        self.enabled_origins
            .get_or_insert_with(Vec::new)
            .push(origin.into());
        self
    }

    pub fn reject_origin(mut self, origin: impl Into<String>) -> Self {
        self.disabled_origins.push(origin.into());
        self
    }

    /// Origin and content checks that do not need the privilege digest.
    pub(crate) fn accepts_content(&self, event: &Event) -> bool {
        if self.ignore.iter().any(|name| name == &event.name) {
            return false;
        }

        if !self.filter.is_empty() {
            let Some(payload) = event.payload.as_object() else {
                return false;
            };
            let matches = self
                .filter
                .iter()
                .all(|(key, expected)| payload.get(key) == Some(expected));
            if !matches {
                return false;
            }
        }

        let origin = event.origin.as_deref().unwrap_or_default();
        if self
            .disabled_origins
            .iter()
            .any(|denied| denied.eq_ignore_ascii_case(origin))
        {
            return false;
        }
        if let Some(allowed) = &self.enabled_origins {
            if !allowed.iter().any(|a| a.eq_ignore_ascii_case(origin)) {
                return false;
            }
        }

        match &self.predicate {
            Some(predicate) => predicate(event),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(name: &str, payload: Value, origin: Option<&str>) -> Event {
        let options = PublishOptions {
            origin: origin.map(str::to_string),
            ..PublishOptions::default()
        };
        Event::new(name, payload, &options)
    }

    #[test]
    fn filter_requires_every_key() {
        let options = SubscribeOptions::default()
            .filter("status", json!("paid"))
            .filter("region", json!("eu"));

        assert!(options.accepts_content(&event(
            "order",
            json!({"status": "paid", "region": "eu", "total": 3}),
            None
        )));
        assert!(!options.accepts_content(&event("order", json!({"status": "paid"}), None)));
        assert!(!options.accepts_content(&event("order", json!("paid"), None)));
    }

    #[test]
    fn origin_lists_are_case_insensitive() {
        let options = SubscribeOptions::default().from_origin("Worker");
        assert!(options.accepts_content(&event("x", Value::Null, Some("worker"))));
        assert!(!options.accepts_content(&event("x", Value::Null, None)));

        let options = SubscribeOptions::default().reject_origin("WORKER");
        assert!(!options.accepts_content(&event("x", Value::Null, Some("worker"))));
        assert!(options.accepts_content(&event("x", Value::Null, Some("main"))));
    }

    #[test]
    fn ignore_and_predicate_combine() {
        let options = SubscribeOptions::default()
            .ignore("noise")
            .predicate(|event| event.payload.get("ok") == Some(&json!(true)));

        assert!(!options.accepts_content(&event("noise", json!({"ok": true}), None)));
        assert!(!options.accepts_content(&event("signal", json!({"ok": false}), None)));
        assert!(options.accepts_content(&event("signal", json!({"ok": true}), None)));
    }
}
