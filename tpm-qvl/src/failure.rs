// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! Structured verification report
//!
//! A [`Failure`] accumulates named events from the different evidence
//! sources of one verification. Acceptance is gated solely on the absence of
//! fatal events; advisory events exist for observability.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Part of the verifier an event originates from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    QuoteValidation,
    PcrValidation,
    MeasuredBoot,
    Ima,
}

impl Component {
    pub fn as_str(self) -> &'static str {
        match self {
            Component::QuoteValidation => "quote_validation",
            Component::PcrValidation => "pcr_validation",
            Component::MeasuredBoot => "measured_boot",
            Component::Ima => "ima",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of an event: a plain message or structured details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventContext {
    Message(String),
    Data(Value),
}

impl From<&str> for EventContext {
    fn from(s: &str) -> Self {
        EventContext::Message(s.to_string())
    }
}

impl From<String> for EventContext {
    fn from(s: String) -> Self {
        EventContext::Message(s)
    }
}

impl From<Value> for EventContext {
    fn from(v: Value) -> Self {
        EventContext::Data(v)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// `<component>[.<sub>...].<name>`
    pub event_id: String,
    pub component: Component,
    pub name: String,
    pub context: EventContext,
    /// Blocks acceptance of the quote
    pub fatal: bool,
    /// A fresh quote from the same agent could still pass
    pub recoverable: bool,
}

/// Mergeable accumulator of events, scoped to a component and sub path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    component: Component,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    sub_components: Vec<String>,
    events: Vec<Event>,
}

impl Failure {
    pub fn new(component: Component) -> Self {
        Self::with_sub_components(component, &[])
    }

    pub fn with_sub_components(component: Component, sub_components: &[&str]) -> Self {
        Self {
            component,
            sub_components: sub_components.iter().map(|s| s.to_string()).collect(),
            events: Vec::new(),
        }
    }

    pub fn component(&self) -> Component {
        self.component
    }

    fn event_id(&self, name: &str) -> String {
        let mut parts = vec![self.component.as_str()];
        parts.extend(self.sub_components.iter().map(String::as_str));
        parts.push(name);
        parts.join(".")
    }

    fn push(&mut self, name: &str, context: EventContext, fatal: bool, recoverable: bool) {
        self.events.push(Event {
            event_id: self.event_id(name),
            component: self.component,
            name: name.to_string(),
            context,
            fatal,
            recoverable,
        });
    }

    /// Record a fatal event that a fresh quote may clear
    pub fn add_event(&mut self, name: &str, context: impl Into<EventContext>) {
        self.push(name, context.into(), true, true);
    }

    /// Record a fatal event that rules out a retry with a fresh quote
    pub fn add_irrecoverable(&mut self, name: &str, context: impl Into<EventContext>) {
        self.push(name, context.into(), true, false);
    }

    /// Record an event that is reported but does not block acceptance
    pub fn add_advisory(&mut self, name: &str, context: impl Into<EventContext>) {
        self.push(name, context.into(), false, true);
    }

    /// Append all events of `other`, keeping their original attribution
    pub fn merge(&mut self, other: Failure) {
        self.events.extend(other.events);
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn has_fatal(&self) -> bool {
        self.events.iter().any(|e| e.fatal)
    }

    pub fn is_accepted(&self) -> bool {
        !self.has_fatal()
    }

    /// True unless some event rules out a retry with a fresh quote
    pub fn recoverable(&self) -> bool {
        self.events.iter().all(|e| e.recoverable)
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn event_ids(&self) -> Vec<&str> {
        self.events.iter().map(|e| e.event_id.as_str()).collect()
    }

    pub fn find(&self, event_id: &str) -> Option<&Event> {
        self.events.iter().find(|e| e.event_id == event_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_ids_include_sub_components() {
        let mut failure = Failure::with_sub_components(Component::MeasuredBoot, &["parser"]);
        failure.add_event("tpm2_eventlog", "running tpm2_eventlog failed");
        assert_eq!(
            failure.event_ids(),
            vec!["measured_boot.parser.tpm2_eventlog"]
        );
    }

    #[test]
    fn test_merge_keeps_attribution() {
        let mut pcr = Failure::new(Component::PcrValidation);
        pcr.add_event("missing_pcrs", json!({"data": [1]}));

        let mut mb = Failure::new(Component::MeasuredBoot);
        mb.add_advisory("invalid_pcr_0", json!({"got": "aa", "expected": "bb"}));

        pcr.merge(mb);
        assert_eq!(pcr.component(), Component::PcrValidation);
        assert_eq!(
            pcr.event_ids(),
            vec!["pcr_validation.missing_pcrs", "measured_boot.invalid_pcr_0"]
        );
        assert_eq!(
            pcr.find("measured_boot.invalid_pcr_0").unwrap().component,
            Component::MeasuredBoot
        );
    }

    #[test]
    fn test_acceptance_and_recoverability() {
        let mut failure = Failure::new(Component::QuoteValidation);
        assert!(failure.is_empty());
        assert!(failure.is_accepted());
        assert!(failure.recoverable());

        failure.add_advisory("note", "just so you know");
        assert!(!failure.is_empty());
        assert!(failure.is_accepted());

        failure.add_event("invalid_pcr_0", "PCR value is not in allowlist");
        assert!(failure.has_fatal());
        assert!(failure.recoverable());

        failure.add_irrecoverable("hash_alg_missing", "Hash algorithm cannot be empty");
        let event = failure.find("quote_validation.hash_alg_missing").unwrap();
        assert!(event.fatal);
        assert!(!event.recoverable);
        assert!(failure.has_fatal());
        assert!(!failure.is_accepted());
        assert!(!failure.recoverable());
    }

    #[test]
    fn test_json_report() {
        let mut failure = Failure::new(Component::PcrValidation);
        failure.add_event(
            "invalid_pcr_16",
            json!({"got": "00", "expected": "11"}),
        );
        let report = serde_json::to_value(&failure).unwrap();
        assert_eq!(report["component"], "pcr_validation");
        assert_eq!(report["events"][0]["event_id"], "pcr_validation.invalid_pcr_16");
        assert_eq!(report["events"][0]["context"]["expected"], "11");
        assert_eq!(report["events"][0]["fatal"], true);

        let back: Failure = serde_json::from_value(report).unwrap();
        assert_eq!(back, failure);
    }
}
