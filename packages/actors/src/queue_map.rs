//! Explicit map from queue names to hosted queues.

use std::collections::HashMap;

use runtime_core::{JobDefinition, QueueReference, RuntimeError, RuntimeResult};

use crate::queue_actor::QueueHandle;

/// Queue topology a job definition is deployed against.
///
/// Passed around by value; there is no process-wide registry.
#[derive(Debug, Clone, Default)]
pub struct QueueMap {
    queues: HashMap<String, QueueHandle>,
}

impl QueueMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a queue, replacing any queue with the same name.
    pub fn insert(&mut self, queue: QueueHandle) -> Option<QueueHandle> {
        self.queues.insert(queue.name().to_string(), queue)
    }

    pub fn with_queue(mut self, queue: QueueHandle) -> Self {
        self.insert(queue);
        self
    }

    pub fn get(&self, name: &str) -> Option<&QueueHandle> {
        self.queues.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<QueueHandle> {
        self.queues.remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Find the queue a reference designates, checking its item type.
    pub fn resolve(&self, reference: &QueueReference) -> RuntimeResult<QueueHandle> {
        let queue = self.queues.get(&reference.name).ok_or_else(|| {
            RuntimeError::Configuration(format!("queue '{}' is not deployed", reference.name))
        })?;
        reference.ensure_compatible(queue.reference())?;
        Ok(queue.clone())
    }

    /// Resolve every queue reference of a job definition.
    pub fn bind(&self, definition: &JobDefinition) -> RuntimeResult<QueueBindings> {
        Ok(QueueBindings {
            input: definition
                .input_queue
                .as_ref()
                .map(|reference| self.resolve(reference))
                .transpose()?,
            extra: definition
                .extra_queues
                .iter()
                .map(|reference| self.resolve(reference))
                .collect::<RuntimeResult<_>>()?,
            outputs: definition
                .output_queues
                .iter()
                .map(|reference| self.resolve(reference))
                .collect::<RuntimeResult<_>>()?,
        })
    }
}

impl FromIterator<QueueHandle> for QueueMap {
    fn from_iter<I: IntoIterator<Item = QueueHandle>>(iter: I) -> Self {
        let mut map = QueueMap::new();
        for queue in iter {
            map.insert(queue);
        }
        map
    }
}

/// Concrete queues bound to one job definition.
#[derive(Debug, Clone, Default)]
pub struct QueueBindings {
    pub input: Option<QueueHandle>,
    pub extra: Vec<QueueHandle>,
    pub outputs: Vec<QueueHandle>,
}

impl QueueBindings {
    /// Bound input queue, or a configuration error when the job has none.
    pub fn input(&self) -> RuntimeResult<&QueueHandle> {
        self.input
            .as_ref()
            .ok_or_else(|| RuntimeError::Configuration("job has no input queue".into()))
    }

    /// Output queue by name.
    pub fn output(&self, name: &str) -> RuntimeResult<&QueueHandle> {
        self.outputs
            .iter()
            .find(|queue| queue.name() == name)
            .ok_or_else(|| RuntimeError::NotFound(format!("output queue '{}'", name)))
    }

    /// Extra queue by name.
    pub fn extra(&self, name: &str) -> RuntimeResult<&QueueHandle> {
        self.extra
            .iter()
            .find(|queue| queue.name() == name)
            .ok_or_else(|| RuntimeError::NotFound(format!("extra queue '{}'", name)))
    }

    /// First output queue, for the common single-output job.
    pub fn first_output(&self) -> RuntimeResult<&QueueHandle> {
        self.outputs
            .first()
            .ok_or_else(|| RuntimeError::Configuration("job has no output queue".into()))
    }
}
