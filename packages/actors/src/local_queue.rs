//! In-process typed queue.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use runtime_core::{QueueBook, QueueReference, QueueStats, RuntimeError, RuntimeResult};
use tokio::sync::Notify;

struct Shared<T> {
    book: Mutex<QueueBook<T>>,
    changed: Notify,
}

/// Typed multi-consumer queue living in the current process.
///
/// Operations never hold the book lock across a suspension point; blocked
/// readers park on a `Notify` that every mutation wakes.
pub struct LocalQueue<T> {
    reference: QueueReference,
    shared: Arc<Shared<T>>,
}

impl<T> Clone for LocalQueue<T> {
    fn clone(&self) -> Self {
        Self {
            reference: self.reference.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> LocalQueue<T> {
    /// Create an empty queue whose item type is `T`.
    pub fn new(name: impl Into<String>) -> Self {
        let reference = QueueReference::of::<T>(name);
        Self {
            shared: Arc::new(Shared {
                book: Mutex::new(QueueBook::new(reference.name.clone())),
                changed: Notify::new(),
            }),
            reference,
        }
    }

    pub fn reference(&self) -> &QueueReference {
        &self.reference
    }

    fn book(&self) -> MutexGuard<'_, QueueBook<T>> {
        self.shared.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake(&self) {
        self.shared.changed.notify_waiters();
    }

    /// Append an item. `producer` is an accounting hint.
    pub fn put(&self, item: T, producer: Option<&str>) -> RuntimeResult<()> {
        self.book().put(item, producer)?;
        self.wake();
        Ok(())
    }

    /// Append many items and return how many were appended.
    pub fn put_iter(&self, items: impl IntoIterator<Item = T>) -> RuntimeResult<usize> {
        let count = self.book().put_iter(items, None)?;
        if count > 0 {
            self.wake();
        }
        Ok(count)
    }

    /// Read the next item for `consumer`.
    ///
    /// With `wait` the call suspends until an item arrives or the consumer is
    /// finished; without it an empty queue yields `QueueEmpty`.
    pub async fn get(&self, consumer: Option<&str>, wait: bool) -> RuntimeResult<T> {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let attempt = self.book().try_get(consumer);
            match attempt {
                Err(RuntimeError::QueueEmpty { .. }) if wait => {}
                other => return other,
            }
            notified.await;
        }
    }

    /// Read up to `count` items, suspending until at least one is available.
    pub async fn get_iter(&self, count: usize, consumer: Option<&str>) -> RuntimeResult<Vec<T>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let attempt = self.book().try_get_batch(consumer, count);
            match attempt {
                Err(RuntimeError::QueueEmpty { .. }) => {}
                other => return other,
            }
            notified.await;
        }
    }

    pub fn qsize(&self) -> usize {
        self.book().qsize()
    }

    /// Register a consumer at the tail. Registering twice keeps the existing cursor.
    pub fn register(&self, consumer: &str) -> u64 {
        self.book().register(consumer)
    }

    pub fn unregister(&self, consumer: &str) -> bool {
        let existed = self.book().unregister(consumer);
        // Readers blocked on this consumer must observe the rejection.
        self.wake();
        existed
    }

    /// Wait until some consumer has an item to read. Returns false on timeout
    /// or when the queue is finished and drained.
    pub async fn wait(&self, timeout: Option<Duration>) -> bool {
        let wait = async {
            loop {
                let notified = self.shared.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let (pending, finished) = {
                    let book = self.book();
                    (book.has_pending(), book.is_finished())
                };
                if pending {
                    return true;
                }
                if finished {
                    return false;
                }
                notified.await;
            }
        };

        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait).await.unwrap_or(false),
            None => wait.await,
        }
    }

    /// Mark completion for one consumer or, without a name, for the whole queue.
    pub fn finish(&self, consumer: Option<&str>) -> RuntimeResult<()> {
        self.book().finish(consumer)?;
        self.wake();
        Ok(())
    }

    pub fn is_exhausted(&self, consumer: Option<&str>) -> bool {
        self.book().is_exhausted(consumer)
    }

    pub fn stats(&self) -> QueueStats {
        self.book().stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blocked_get_wakes_on_put() {
        let queue: LocalQueue<u32> = LocalQueue::new("numbers");
        queue.register("x");

        let reader = queue.clone();
        let task = tokio::spawn(async move { reader.get(Some("x"), true).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.put(5, None).unwrap();

        assert_eq!(task.await.unwrap().unwrap(), 5);
    }

    #[tokio::test]
    async fn finish_releases_blocked_reader() {
        let queue: LocalQueue<u32> = LocalQueue::new("numbers");
        queue.register("x");
        queue.register("y");

        let reader = queue.clone();
        let task = tokio::spawn(async move { reader.get(Some("x"), true).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.finish(Some("x")).unwrap();

        assert!(matches!(
            task.await.unwrap(),
            Err(RuntimeError::QueueFinished { .. })
        ));
        queue.put(1, None).unwrap();
        assert_eq!(queue.get(Some("y"), true).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn non_blocking_get_reports_empty() {
        let queue: LocalQueue<u32> = LocalQueue::new("numbers");
        queue.register("x");
        assert!(matches!(
            queue.get(Some("x"), false).await,
            Err(RuntimeError::QueueEmpty { .. })
        ));
    }

    #[tokio::test]
    async fn wait_reports_data_or_timeout() {
        let queue: LocalQueue<&'static str> = LocalQueue::new("words");
        queue.register("x");
        assert!(!queue.wait(Some(Duration::from_millis(20))).await);

        let writer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.put("hello", Some("writer")).unwrap();
        });
        assert!(queue.wait(Some(Duration::from_secs(2))).await);
    }

    #[tokio::test]
    async fn get_iter_returns_what_is_available() {
        let queue: LocalQueue<u32> = LocalQueue::new("numbers");
        queue.register("x");
        assert_eq!(queue.put_iter([1, 2, 3]).unwrap(), 3);

        assert_eq!(queue.get_iter(5, Some("x")).await.unwrap(), vec![1, 2, 3]);
        assert_eq!(queue.qsize(), 0);
    }
}
