//! Event occurrences, their canonical references and the lock table.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::error::{RuntimeError, RuntimeResult};

/// Identifier of a lock session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Ulid);

impl SessionId {
    /// Create a fresh random session ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a session ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical identity of an event occurrence.
///
/// In generic mode the reference is built from every property in the given
/// order, so the same pairs in a different order give a different reference.
/// In identificator mode only the identification pairs count and they are
/// sorted by key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventReference {
    event_type: String,
    values: Vec<(String, Value)>,
    by_identificators: bool,
    reference: String,
}

impl EventReference {
    /// Reference built from all properties, order-sensitive.
    pub fn generic(event_type: impl Into<String>, properties: Vec<(String, Value)>) -> Self {
        let event_type = event_type.into();
        let reference = render_reference(&event_type, &properties);
        Self {
            event_type,
            values: properties,
            by_identificators: false,
            reference,
        }
    }

    /// Reference built from identification pairs. At least one pair is required.
    pub fn by_identificators(
        event_type: impl Into<String>,
        mut identificators: Vec<(String, Value)>,
    ) -> RuntimeResult<Self> {
        let event_type = event_type.into();
        if identificators.is_empty() {
            return Err(RuntimeError::Configuration(format!(
                "values must be provided when content of '{}' can be identified",
                event_type
            )));
        }
        identificators.sort_by(|a, b| a.0.cmp(&b.0));
        let reference = render_reference(&event_type, &identificators);
        Ok(Self {
            event_type,
            values: identificators,
            by_identificators: true,
            reference,
        })
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn values(&self) -> &[(String, Value)] {
        &self.values
    }

    pub fn is_by_identificators(&self) -> bool {
        self.by_identificators
    }

    /// Deterministic key, usable as a map or lock key.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Whether `event` is an occurrence this reference designates.
    ///
    /// Identificator references only require their pairs to be present on the
    /// event; generic references require the exact property list.
    pub fn matches(&self, event: &Event) -> bool {
        if self.event_type != event.event_type {
            return false;
        }
        if self.by_identificators {
            self.values
                .iter()
                .all(|(key, value)| event.property(key) == Some(value))
        } else {
            self.values == event.properties
        }
    }
}

impl PartialEq for EventReference {
    fn eq(&self, other: &Self) -> bool {
        self.reference == other.reference
    }
}

impl Eq for EventReference {}

impl std::hash::Hash for EventReference {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.reference.hash(state);
    }
}

impl std::fmt::Display for EventReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reference)
    }
}

/// Renders `type/key=value/...`. Separators inside the type and keys are
/// escaped and values are written as JSON, so strings stay quoted and
/// distinct pair lists never render alike.
fn render_reference(event_type: &str, values: &[(String, Value)]) -> String {
    let mut reference = String::new();
    push_escaped(&mut reference, event_type);
    for (key, value) in values {
        reference.push('/');
        push_escaped(&mut reference, key);
        reference.push('=');
        reference.push_str(&value.to_string());
    }
    reference
}

fn push_escaped(out: &mut String, text: &str) {
    for c in text.chars() {
        if matches!(c, '\\' | '/' | '=') {
            out.push('\\');
        }
        out.push(c);
    }
}

/// A typed event occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event type used for handler routing.
    pub event_type: String,
    /// Ordered properties.
    #[serde(default)]
    pub properties: Vec<(String, Value)>,
    /// Property keys that identify the occurrence.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identificators: Vec<String>,
    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            properties: Vec::new(),
            identificators: Vec::new(),
            occurred_at: Utc::now(),
        }
    }

    /// Append a property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    /// Append a property and mark it as identifying the occurrence.
    pub fn with_identificator(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        self.identificators.push(key.clone());
        self.properties.push((key, value.into()));
        self
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, value)| value)
    }

    /// Canonical reference of this occurrence.
    pub fn reference(&self) -> RuntimeResult<EventReference> {
        if self.identificators.is_empty() {
            return Ok(EventReference::generic(
                self.event_type.clone(),
                self.properties.clone(),
            ));
        }
        let pairs = self
            .identificators
            .iter()
            .filter_map(|key| self.property(key).map(|v| (key.clone(), v.clone())))
            .collect();
        EventReference::by_identificators(self.event_type.clone(), pairs)
    }
}

/// Longest lock TTL accepted, roughly one hundred years.
pub const MAX_LOCK_TTL_MS: u64 = 100 * 365 * 24 * 60 * 60 * 1000;

/// A lock held on an event reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub reference: String,
    pub session_id: SessionId,
    pub acquired_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
}

impl Lock {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = self.ttl_ms?;
        let delta = i64::try_from(ttl).ok().and_then(Duration::try_milliseconds)?;
        // An expiry past the representable range never comes.
        self.acquired_at.checked_add_signed(delta)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|expiry| now >= expiry)
    }
}

/// Locks the caller already owns, keyed by event reference.
pub type SessionMap = HashMap<String, SessionId>;

/// Authoritative table of event locks.
///
/// At most one unexpired lock exists per reference. Every method takes the
/// current time so expiry can be driven deterministically.
#[derive(Debug, Default)]
pub struct LockTable {
    by_reference: HashMap<String, Lock>,
    by_session: HashMap<SessionId, String>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a lock for `reference`, returning a fresh session ID.
    pub fn acquire(
        &mut self,
        reference: &EventReference,
        ttl_ms: Option<u64>,
        now: DateTime<Utc>,
    ) -> RuntimeResult<SessionId> {
        if let Some(ttl) = ttl_ms.filter(|ttl| *ttl > MAX_LOCK_TTL_MS) {
            return Err(RuntimeError::Configuration(format!(
                "lock ttl of {}ms exceeds the maximum of {}ms",
                ttl, MAX_LOCK_TTL_MS
            )));
        }
        if let Some(existing) = self.by_reference.get(reference.reference()) {
            if !existing.is_expired(now) {
                return Err(RuntimeError::LockHeld {
                    reference: reference.reference().to_string(),
                });
            }
            let stale = existing.session_id;
            self.by_session.remove(&stale);
        }

        let session_id = SessionId::new();
        let lock = Lock {
            reference: reference.reference().to_string(),
            session_id,
            acquired_at: now,
            ttl_ms,
        };
        self.by_reference
            .insert(reference.reference().to_string(), lock);
        self.by_session
            .insert(session_id, reference.reference().to_string());
        Ok(session_id)
    }

    /// Session currently holding an unexpired lock on `reference`.
    pub fn session_for(&self, reference: &EventReference, now: DateTime<Utc>) -> Option<SessionId> {
        self.by_reference
            .get(reference.reference())
            .filter(|lock| !lock.is_expired(now))
            .map(|lock| lock.session_id)
    }

    /// Reference locked by `session_id`, if its lock is still live.
    pub fn reference_for(&self, session_id: SessionId, now: DateTime<Utc>) -> Option<&str> {
        let reference = self.by_session.get(&session_id)?;
        self.by_reference
            .get(reference)
            .filter(|lock| lock.session_id == session_id && !lock.is_expired(now))
            .map(|lock| lock.reference.as_str())
    }

    /// Release the lock owned by `session_id`. Unknown or expired sessions are a no-op.
    ///
    /// Returns the reference that was released, if any.
    pub fn release(&mut self, session_id: SessionId, now: DateTime<Utc>) -> Option<String> {
        let reference = self.by_session.remove(&session_id)?;
        let owned = self
            .by_reference
            .get(&reference)
            .is_some_and(|lock| lock.session_id == session_id);
        if !owned {
            return None;
        }
        let lock = self.by_reference.remove(&reference)?;
        if lock.is_expired(now) {
            return None;
        }
        Some(reference)
    }

    /// Whether `reference` is locked by someone other than the sessions in `owned`.
    pub fn is_locked(
        &self,
        reference: &EventReference,
        owned: &SessionMap,
        now: DateTime<Utc>,
    ) -> bool {
        match self.session_for(reference, now) {
            Some(session) => owned.get(reference.reference()) != Some(&session),
            None => false,
        }
    }

    /// Drop expired locks and return how many were removed.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = self
            .by_reference
            .iter()
            .filter(|(_, lock)| lock.is_expired(now))
            .map(|(reference, _)| reference.clone())
            .collect();
        for reference in &expired {
            if let Some(lock) = self.by_reference.remove(reference) {
                self.by_session.remove(&lock.session_id);
            }
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.by_reference.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_reference.is_empty()
    }
}
