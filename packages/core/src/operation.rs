//! Boolean operations over event history and handler definitions.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::{Event, EventReference};

/// Condition on a single event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    /// Any event of the type matches.
    Any,
    /// The event must be designated by this reference.
    Reference { reference: EventReference },
    /// A property must equal the given value.
    PropertyEquals { key: String, value: Value },
    /// A property must be present.
    PropertyExists { key: String },
}

impl Predicate {
    pub fn test(&self, event: &Event) -> bool {
        match self {
            Predicate::Any => true,
            Predicate::Reference { reference } => reference.matches(event),
            Predicate::PropertyEquals { key, value } => event.property(key) == Some(value),
            Predicate::PropertyExists { key } => event.property(key).is_some(),
        }
    }
}

/// Boolean expression over the latest event of each type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    And { ops: Vec<Operation> },
    Or { ops: Vec<Operation> },
    Not { operand: Box<Operation> },
    /// True when the last event of `event_type` satisfies `predicate`.
    Matches {
        event_type: String,
        predicate: Predicate,
    },
}

impl Operation {
    pub fn and(ops: Vec<Operation>) -> Self {
        Operation::And { ops }
    }

    pub fn or(ops: Vec<Operation>) -> Self {
        Operation::Or { ops }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(op: Operation) -> Self {
        Operation::Not {
            operand: Box::new(op),
        }
    }

    /// Last event of `event_type` exists and satisfies `predicate`.
    pub fn matches(event_type: impl Into<String>, predicate: Predicate) -> Self {
        Operation::Matches {
            event_type: event_type.into(),
            predicate,
        }
    }

    /// Any event of `event_type` has been seen.
    pub fn seen(event_type: impl Into<String>) -> Self {
        Self::matches(event_type, Predicate::Any)
    }

    /// Evaluate against a history view.
    pub fn evaluate(&self, history: &HistoryView<'_>) -> bool {
        match self {
            Operation::And { ops } => ops.iter().all(|op| op.evaluate(history)),
            Operation::Or { ops } => ops.iter().any(|op| op.evaluate(history)),
            Operation::Not { operand } => !operand.evaluate(history),
            Operation::Matches {
                event_type,
                predicate,
            } => history
                .last(event_type)
                .is_some_and(|event| predicate.test(event)),
        }
    }

    /// Every event type the operation reads.
    pub fn event_types(&self) -> BTreeSet<String> {
        let mut types = BTreeSet::new();
        self.collect_types(&mut types);
        types
    }

    fn collect_types(&self, types: &mut BTreeSet<String>) {
        match self {
            Operation::And { ops } | Operation::Or { ops } => {
                for op in ops {
                    op.collect_types(types);
                }
            }
            Operation::Not { operand } => operand.collect_types(types),
            Operation::Matches { event_type, .. } => {
                types.insert(event_type.clone());
            }
        }
    }
}

/// Last event recorded per type.
#[derive(Debug, Clone, Default)]
pub struct EventHistory {
    last: HashMap<String, Event>,
}

impl EventHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: Event) {
        self.last.insert(event.event_type.clone(), event);
    }

    pub fn last(&self, event_type: &str) -> Option<&Event> {
        self.last.get(event_type)
    }

    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}

/// Layered read view: a pending event, then a session overlay, then the global history.
#[derive(Debug, Clone, Copy)]
pub struct HistoryView<'a> {
    global: &'a EventHistory,
    overlay: Option<&'a EventHistory>,
    newest: Option<&'a Event>,
}

impl<'a> HistoryView<'a> {
    pub fn new(global: &'a EventHistory) -> Self {
        Self {
            global,
            overlay: None,
            newest: None,
        }
    }

    pub fn with_overlay(mut self, overlay: Option<&'a EventHistory>) -> Self {
        self.overlay = overlay;
        self
    }

    /// Treat `event` as the newest fact.
    pub fn with_newest(mut self, event: &'a Event) -> Self {
        self.newest = Some(event);
        self
    }

    pub fn last(&self, event_type: &str) -> Option<&'a Event> {
        if let Some(event) = self.newest
            && event.event_type == event_type
        {
            return Some(event);
        }
        self.overlay
            .and_then(|overlay| overlay.last(event_type))
            .or_else(|| self.global.last(event_type))
    }
}

/// Identifier of a registered handler.
pub type HandlerId = String;

/// Serializable part of a handler: which events it listens to and when it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerDefinition {
    pub handler_id: HandlerId,
    pub subscribed_event_types: Vec<String>,
    pub operation: Operation,
}

impl HandlerDefinition {
    /// Handler subscribed to every event type its operation reads.
    pub fn new(handler_id: impl Into<String>, operation: Operation) -> Self {
        Self {
            handler_id: handler_id.into(),
            subscribed_event_types: operation.event_types().into_iter().collect(),
            operation,
        }
    }

    /// Override the subscribed event types.
    pub fn with_subscriptions(mut self, event_types: Vec<String>) -> Self {
        self.subscribed_event_types = event_types;
        self
    }

    pub fn is_subscribed(&self, event_type: &str) -> bool {
        self.subscribed_event_types.iter().any(|t| t == event_type)
    }
}
