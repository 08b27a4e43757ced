//! Queue domain types: references, statistics and the cursor book.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{RuntimeError, RuntimeResult};

/// Consumer used when a caller does not name one.
pub const DEFAULT_CONSUMER: &str = "__default__";

/// Producer bucket for puts without a producer hint.
pub const ANONYMOUS_PRODUCER: &str = "__anonymous__";

/// Reference to a queue hosted by some process.
///
/// Jobs only ever hold references; the concrete handle is bound at start time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueReference {
    /// Queue name, unique within a supervisor.
    pub name: String,
    /// Declared element type.
    pub item_type: String,
}

impl QueueReference {
    pub fn new(name: impl Into<String>, item_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            item_type: item_type.into(),
        }
    }

    /// Reference whose item type is the Rust type name of `T`.
    pub fn of<T>(name: impl Into<String>) -> Self {
        Self::new(name, std::any::type_name::<T>())
    }

    /// Check that `other` designates the same queue with the same element type.
    pub fn ensure_compatible(&self, other: &QueueReference) -> RuntimeResult<()> {
        if self.name != other.name {
            return Err(RuntimeError::Configuration(format!(
                "queue reference '{}' bound to queue '{}'",
                self.name, other.name
            )));
        }
        if self.item_type != other.item_type {
            return Err(RuntimeError::Configuration(format!(
                "queue '{}' carries '{}' but '{}' was expected",
                self.name, other.item_type, self.item_type
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for QueueReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}<{}>", self.name, self.item_type)
    }
}

/// Snapshot of a queue's bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueStats {
    /// Items still held in memory.
    pub length: u64,
    /// Items not yet consumed by the slowest consumer.
    pub pending: u64,
    /// Unconsumed items per registered consumer.
    pub consumers: BTreeMap<String, u64>,
    /// Items appended per producer hint.
    pub produced: BTreeMap<String, u64>,
    /// Whether the queue was finished globally.
    pub finished: bool,
}

impl QueueStats {
    /// Total items ever appended.
    pub fn total_produced(&self) -> u64 {
        self.produced.values().sum()
    }
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
    position: u64,
    /// Set when the consumer was finished: nothing at or past this index is delivered.
    limit: Option<u64>,
}

/// Shared ordered sequence with one read cursor per consumer.
///
/// The book is purely synchronous. Hosts wrap it with their own suspension
/// mechanism and retry `try_get` when items arrive.
#[derive(Debug, Clone)]
pub struct QueueBook<T> {
    name: String,
    items: VecDeque<T>,
    /// Absolute index of `items[0]`.
    base: u64,
    cursors: HashMap<String, Cursor>,
    produced: HashMap<String, u64>,
    finished: bool,
}

impl<T: Clone> QueueBook<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: VecDeque::new(),
            base: 0,
            cursors: HashMap::new(),
            produced: HashMap::new(),
            finished: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn tail(&self) -> u64 {
        self.base + self.items.len() as u64
    }

    /// Register a consumer at the current tail. Re-registering returns the existing cursor.
    pub fn register(&mut self, consumer: &str) -> u64 {
        let tail = self.tail();
        self.cursors
            .entry(consumer.to_string())
            .or_insert(Cursor {
                position: tail,
                limit: None,
            })
            .position
    }

    /// Drop a consumer's cursor. Returns whether it existed.
    pub fn unregister(&mut self, consumer: &str) -> bool {
        let existed = self.cursors.remove(consumer).is_some();
        self.trim();
        existed
    }

    pub fn is_registered(&self, consumer: &str) -> bool {
        self.cursors.contains_key(consumer)
    }

    pub fn consumers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.cursors.keys().cloned().collect();
        names.sort();
        names
    }

    /// Append one item. `producer` is only used for accounting.
    pub fn put(&mut self, item: T, producer: Option<&str>) -> RuntimeResult<()> {
        if self.finished {
            return Err(RuntimeError::QueueFinished {
                queue: self.name.clone(),
            });
        }
        self.items.push_back(item);
        *self
            .produced
            .entry(producer.unwrap_or(ANONYMOUS_PRODUCER).to_string())
            .or_insert(0) += 1;
        Ok(())
    }

    /// Append items in order and return how many were appended.
    pub fn put_iter(
        &mut self,
        items: impl IntoIterator<Item = T>,
        producer: Option<&str>,
    ) -> RuntimeResult<usize> {
        if self.finished {
            return Err(RuntimeError::QueueFinished {
                queue: self.name.clone(),
            });
        }
        let mut count = 0;
        for item in items {
            self.put(item, producer)?;
            count += 1;
        }
        Ok(count)
    }

    fn resolve(&mut self, consumer: Option<&str>) -> RuntimeResult<String> {
        match consumer {
            Some(name) if self.cursors.contains_key(name) => Ok(name.to_string()),
            Some(name) => Err(RuntimeError::UnknownConsumer {
                queue: self.name.clone(),
                consumer: name.to_string(),
            }),
            None => {
                // The unnamed consumer starts at the oldest retained item.
                let base = self.base;
                self.cursors
                    .entry(DEFAULT_CONSUMER.to_string())
                    .or_insert(Cursor {
                        position: base,
                        limit: None,
                    });
                Ok(DEFAULT_CONSUMER.to_string())
            }
        }
    }

    /// Take the next item for a consumer without waiting.
    ///
    /// Fails with `QueueEmpty` when the consumer is caught up and more items may
    /// still arrive, and with `QueueFinished` when none will.
    pub fn try_get(&mut self, consumer: Option<&str>) -> RuntimeResult<T> {
        let name = self.resolve(consumer)?;
        let tail = self.tail();
        let finished = self.finished;
        let cursor = self
            .cursors
            .get_mut(&name)
            .ok_or_else(|| RuntimeError::UnknownConsumer {
                queue: self.name.clone(),
                consumer: name.clone(),
            })?;

        let end = cursor.limit.map_or(tail, |limit| limit.min(tail));
        if cursor.position < end {
            let index = (cursor.position - self.base) as usize;
            cursor.position += 1;
            let item = self.items[index].clone();
            self.trim();
            return Ok(item);
        }

        if finished || cursor.limit.is_some() {
            Err(RuntimeError::QueueFinished {
                queue: self.name.clone(),
            })
        } else {
            Err(RuntimeError::QueueEmpty {
                queue: self.name.clone(),
            })
        }
    }

    /// Take up to `count` available items. Fails like `try_get` when none are available.
    pub fn try_get_batch(&mut self, consumer: Option<&str>, count: usize) -> RuntimeResult<Vec<T>> {
        let mut batch = Vec::new();
        while batch.len() < count {
            match self.try_get(consumer) {
                Ok(item) => batch.push(item),
                Err(err) if batch.is_empty() => return Err(err),
                Err(_) => break,
            }
        }
        Ok(batch)
    }

    /// Whether the consumer has nothing left and never will.
    pub fn is_exhausted(&self, consumer: Option<&str>) -> bool {
        let name = consumer.unwrap_or(DEFAULT_CONSUMER);
        let tail = self.tail();
        match self.cursors.get(name) {
            Some(cursor) => {
                let end = cursor.limit.map_or(tail, |limit| limit.min(tail));
                cursor.position >= end && (self.finished || cursor.limit.is_some())
            }
            None => self.finished && self.items.is_empty(),
        }
    }

    /// Whether any consumer can make progress.
    pub fn has_pending(&self) -> bool {
        self.qsize() > 0
    }

    /// Items not yet consumed by the slowest consumer, or the retained length without consumers.
    pub fn qsize(&self) -> usize {
        match self.cursors.values().map(|c| c.position).min() {
            Some(slowest) => (self.tail() - slowest) as usize,
            None => self.items.len(),
        }
    }

    /// Mark completion for one consumer, or for the whole queue.
    pub fn finish(&mut self, consumer: Option<&str>) -> RuntimeResult<()> {
        match consumer {
            None => {
                self.finished = true;
                Ok(())
            }
            Some(name) => {
                let tail = self.tail();
                let cursor =
                    self.cursors
                        .get_mut(name)
                        .ok_or_else(|| RuntimeError::UnknownConsumer {
                            queue: self.name.clone(),
                            consumer: name.to_string(),
                        })?;
                cursor.limit.get_or_insert(tail);
                Ok(())
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn stats(&self) -> QueueStats {
        let tail = self.tail();
        QueueStats {
            length: self.items.len() as u64,
            pending: self.qsize() as u64,
            consumers: self
                .cursors
                .iter()
                .map(|(name, cursor)| (name.clone(), tail - cursor.position))
                .collect(),
            produced: self
                .produced
                .iter()
                .map(|(name, count)| (name.clone(), *count))
                .collect(),
            finished: self.finished,
        }
    }

    /// Release items every registered consumer has moved past.
    fn trim(&mut self) {
        let Some(slowest) = self.cursors.values().map(|c| c.position).min() else {
            return;
        };
        while self.base < slowest && self.items.pop_front().is_some() {
            self.base += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_consumer_reads_in_order() {
        let mut book = QueueBook::new("numbers");
        book.register("x");
        book.put_iter(["a", "b", "c"], None).unwrap();

        assert_eq!(book.try_get(Some("x")).unwrap(), "a");
        assert_eq!(book.try_get(Some("x")).unwrap(), "b");
        assert_eq!(book.try_get(Some("x")).unwrap(), "c");
        assert!(matches!(
            book.try_get(Some("x")),
            Err(RuntimeError::QueueEmpty { .. })
        ));
    }

    #[test]
    fn cursors_are_independent() {
        let mut book = QueueBook::new("letters");
        book.register("x");
        book.register("y");
        book.put("a", None).unwrap();
        book.put("b", None).unwrap();

        assert_eq!(book.try_get(Some("x")).unwrap(), "a");
        assert_eq!(book.try_get(Some("x")).unwrap(), "b");
        assert_eq!(book.qsize(), 2);
        assert_eq!(book.try_get(Some("y")).unwrap(), "a");
        assert_eq!(book.try_get(Some("y")).unwrap(), "b");
        assert_eq!(book.qsize(), 0);
        assert_eq!(book.stats().length, 0);
    }

    #[test]
    fn new_consumers_start_at_tail() {
        let mut book = QueueBook::new("late");
        book.register("early");
        book.put(1, None).unwrap();
        book.register("late");
        book.put(2, None).unwrap();

        assert_eq!(book.try_get(Some("late")).unwrap(), 2);
        assert_eq!(book.try_get(Some("early")).unwrap(), 1);
    }

    #[test]
    fn register_twice_keeps_cursor() {
        let mut book = QueueBook::new("q");
        book.register("x");
        book.put(1, None).unwrap();
        book.put(2, None).unwrap();
        book.try_get(Some("x")).unwrap();

        assert_eq!(book.register("x"), 1);
        assert_eq!(book.try_get(Some("x")).unwrap(), 2);
    }

    #[test]
    fn unknown_consumer_is_rejected() {
        let mut book: QueueBook<u32> = QueueBook::new("q");
        let err = book.try_get(Some("ghost")).unwrap_err();
        assert_eq!(
            err,
            RuntimeError::UnknownConsumer {
                queue: "q".into(),
                consumer: "ghost".into()
            }
        );
        assert!(book.finish(Some("ghost")).is_err());
    }

    #[test]
    fn consumer_finish_only_affects_that_consumer() {
        let mut book = QueueBook::new("q");
        book.register("x");
        book.register("y");
        book.finish(Some("x")).unwrap();
        book.put(7, None).unwrap();

        assert!(matches!(
            book.try_get(Some("x")),
            Err(RuntimeError::QueueFinished { .. })
        ));
        assert!(book.is_exhausted(Some("x")));
        assert_eq!(book.try_get(Some("y")).unwrap(), 7);
    }

    #[test]
    fn global_finish_drains_then_fails() {
        let mut book = QueueBook::new("q");
        book.register("x");
        book.put(1, None).unwrap();
        book.finish(None).unwrap();

        assert!(book.put(2, None).is_err());
        assert_eq!(book.try_get(Some("x")).unwrap(), 1);
        assert!(matches!(
            book.try_get(Some("x")),
            Err(RuntimeError::QueueFinished { .. })
        ));
    }

    #[test]
    fn qsize_without_consumers_is_length() {
        let mut book = QueueBook::new("q");
        book.put_iter(0..5, Some("producer-a")).unwrap();
        assert_eq!(book.qsize(), 5);
        assert_eq!(book.stats().produced.get("producer-a"), Some(&5));
    }

    #[test]
    fn default_consumer_sees_retained_history() {
        let mut book = QueueBook::new("q");
        book.put("first", None).unwrap();
        assert_eq!(book.try_get(None).unwrap(), "first");
        assert!(book.is_registered(DEFAULT_CONSUMER));
    }

    #[test]
    fn batch_returns_available_items() {
        let mut book = QueueBook::new("q");
        book.register("x");
        book.put_iter([1, 2, 3], None).unwrap();

        assert_eq!(book.try_get_batch(Some("x"), 2).unwrap(), vec![1, 2]);
        assert_eq!(book.try_get_batch(Some("x"), 10).unwrap(), vec![3]);
        assert!(book.try_get_batch(Some("x"), 1).is_err());
    }

    #[test]
    fn reference_compatibility() {
        let expected = QueueReference::of::<u64>("numbers");
        assert!(expected.ensure_compatible(&QueueReference::of::<u64>("numbers")).is_ok());
        assert!(expected.ensure_compatible(&QueueReference::of::<String>("numbers")).is_err());
    }
}
