//! Wait primitive over a named set of boolean flags.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// A set of named flags that tasks can wait on.
///
/// Flags are levels, not pulses: a waiter returns immediately when a flag it
/// waits for is already set, so a `set` racing with a `wait` is never lost.
#[derive(Debug, Clone)]
pub struct CombinedEvents {
    flags: Arc<watch::Sender<BTreeMap<String, bool>>>,
}

impl CombinedEvents {
    /// Create the set with every flag cleared.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let flags = names.into_iter().map(|name| (name.into(), false)).collect();
        let (tx, _) = watch::channel(flags);
        Self { flags: Arc::new(tx) }
    }

    /// Set a flag, adding it if unknown. Returns whether it changed.
    pub fn set(&self, name: &str) -> bool {
        self.update(name, true)
    }

    /// Clear a flag. Returns whether it changed.
    pub fn clear(&self, name: &str) -> bool {
        self.update(name, false)
    }

    fn update(&self, name: &str, value: bool) -> bool {
        self.flags.send_if_modified(|flags| match flags.get_mut(name) {
            Some(slot) => {
                let changed = *slot != value;
                *slot = value;
                changed
            }
            None => {
                flags.insert(name.to_string(), value);
                value
            }
        })
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.flags.borrow().get(name).copied().unwrap_or(false)
    }

    /// Names of all flags currently set.
    pub fn set_flags(&self) -> Vec<String> {
        self.flags
            .borrow()
            .iter()
            .filter(|(_, set)| **set)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Wait until any of `names` is set and return the first one found.
    ///
    /// Returns `None` when the timeout elapses first.
    pub async fn wait_any_set(&self, names: &[&str], timeout: Option<Duration>) -> Option<String> {
        let first_set = |flags: &BTreeMap<String, bool>| {
            names
                .iter()
                .find(|name| flags.get(**name).copied().unwrap_or(false))
                .map(|name| name.to_string())
        };

        let wait = async {
            let mut rx = self.flags.subscribe();
            let hit = match rx.wait_for(|flags| first_set(flags).is_some()).await {
                Ok(flags) => first_set(&flags),
                Err(_) => None,
            };
            hit
        };

        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait).await.ok().flatten(),
            None => wait.await,
        }
    }

    /// Wait until every one of `names` is set. Returns false on timeout.
    pub async fn wait_all_set(&self, names: &[&str], timeout: Option<Duration>) -> bool {
        let wait = async {
            let mut rx = self.flags.subscribe();
            let reached = rx
                .wait_for(|flags| {
                    names
                        .iter()
                        .all(|name| flags.get(*name).copied().unwrap_or(false))
                })
                .await
                .is_ok();
            reached
        };

        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait).await.unwrap_or(false),
            None => wait.await,
        }
    }

    /// Wait for a single flag. Returns false on timeout.
    pub async fn wait(&self, name: &str, timeout: Option<Duration>) -> bool {
        self.wait_any_set(&[name], timeout).await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_immediately_when_already_set() {
        let events = CombinedEvents::new(["a", "b"]);
        events.set("b");
        let hit = events.wait_any_set(&["a", "b"], Some(Duration::from_millis(10))).await;
        assert_eq!(hit.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn times_out_when_nothing_set() {
        let events = CombinedEvents::new(["a"]);
        assert!(!events.wait("a", Some(Duration::from_millis(20))).await);
    }

    #[tokio::test]
    async fn wakes_waiter_from_another_task() {
        let events = CombinedEvents::new(["ready", "done"]);
        let setter = events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            setter.set("done");
        });

        let hit = events.wait_any_set(&["ready", "done"], Some(Duration::from_secs(2))).await;
        assert_eq!(hit.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn wait_all_needs_every_flag() {
        let events = CombinedEvents::new(["a", "b"]);
        events.set("a");
        assert!(!events.wait_all_set(&["a", "b"], Some(Duration::from_millis(20))).await);
        events.set("b");
        assert!(events.wait_all_set(&["a", "b"], None).await);
        assert_eq!(events.set_flags(), vec!["a", "b"]);
    }

    #[test]
    fn set_and_clear_report_changes() {
        let events = CombinedEvents::new(["a"]);
        assert!(events.set("a"));
        assert!(!events.set("a"));
        assert!(events.clear("a"));
        assert!(!events.is_set("a"));
        assert!(events.set("new"));
        assert!(events.is_set("new"));
    }
}
