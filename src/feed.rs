//! Lazy data feeds for data-driven steps.
//!
//! A feed is a named, thread-safe item stream bound to a step. Each virtual
//! user pulls the next item when its step runs, so test data is distributed
//! across copies without coordination. Circular feeds wrap around forever;
//! one-shot feeds run dry and then deliver nothing.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeedMode {
    /// Wrap back to the first item after the last.
    Circular,

    /// Deliver each item once, then nothing.
    Once,
}

/// A named item stream shared by all copies of the step it is attached to.
///
/// # Example
/// ```
/// use stampede::feed::Feed;
///
/// let users = Feed::circular("users", vec!["alice", "bob"]);
/// assert_eq!(*users.pull().unwrap(), "alice");
/// assert_eq!(*users.pull().unwrap(), "bob");
/// assert_eq!(*users.pull().unwrap(), "alice"); // wrapped
/// ```
pub struct Feed<T> {
    name: String,
    items: Vec<Arc<T>>,
    cursor: AtomicUsize,
    mode: FeedMode,
}

impl<T: Send + Sync + 'static> Feed<T> {
    /// A feed that cycles through `items` forever.
    pub fn circular(name: impl Into<String>, items: Vec<T>) -> Arc<Self> {
        Self::build(name.into(), items, FeedMode::Circular)
    }

    /// A feed that delivers each item exactly once.
    pub fn once(name: impl Into<String>, items: Vec<T>) -> Arc<Self> {
        Self::build(name.into(), items, FeedMode::Once)
    }

    fn build(name: String, items: Vec<T>, mode: FeedMode) -> Arc<Self> {
        debug!(feed = %name, items = items.len(), mode = ?mode, "Feed created");
        Arc::new(Self {
            name,
            items: items.into_iter().map(Arc::new).collect(),
            cursor: AtomicUsize::new(0),
            mode,
        })
    }

    /// The feed name, used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pull the next item.
    ///
    /// Returns `None` when the feed is empty, or exhausted for one-shot
    /// feeds.
    pub fn pull(&self) -> Option<Arc<T>> {
        if self.items.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed);
        match self.mode {
            FeedMode::Circular => Some(Arc::clone(&self.items[idx % self.items.len()])),
            FeedMode::Once => {
                if idx < self.items.len() {
                    Some(Arc::clone(&self.items[idx]))
                } else {
                    if idx == self.items.len() {
                        warn!(feed = %self.name, "Feed exhausted; steps will receive no item");
                    }
                    None
                }
            }
        }
    }
}

/// Type-erased view of a feed, held by steps so scenarios stay untyped.
pub trait ErasedFeed: Send + Sync {
    fn name(&self) -> &str;
    fn pull_erased(&self) -> Option<Arc<dyn Any + Send + Sync>>;
}

impl<T: Send + Sync + 'static> ErasedFeed for Feed<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn pull_erased(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.pull().map(|item| item as Arc<dyn Any + Send + Sync>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circular_wraps_around() {
        let feed = Feed::circular("nums", vec![1, 2, 3]);
        let pulled: Vec<i32> = (0..7).map(|_| *feed.pull().unwrap()).collect();
        assert_eq!(pulled, vec![1, 2, 3, 1, 2, 3, 1]);
    }

    #[test]
    fn test_once_exhausts() {
        let feed = Feed::once("nums", vec![10, 20]);
        assert_eq!(*feed.pull().unwrap(), 10);
        assert_eq!(*feed.pull().unwrap(), 20);
        assert!(feed.pull().is_none());
        assert!(feed.pull().is_none());
    }

    #[test]
    fn test_empty_feed_returns_none() {
        let feed: Arc<Feed<String>> = Feed::circular("empty", Vec::new());
        assert!(feed.pull().is_none());
    }

    #[test]
    fn test_erased_pull_downcasts() {
        let feed = Feed::circular("words", vec!["a".to_string()]);
        let erased: Arc<dyn ErasedFeed> = feed;
        let item = erased.pull_erased().unwrap();
        let word = item.downcast_ref::<String>().unwrap();
        assert_eq!(word, "a");
    }

    #[test]
    fn test_concurrent_pull_covers_all_items() {
        use std::collections::HashSet;
        use std::thread;

        let feed = Feed::once("ids", (0..100).collect::<Vec<u32>>());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let feed = Arc::clone(&feed);
            handles.push(thread::spawn(move || {
                let mut seen = Vec::new();
                while let Some(item) = feed.pull() {
                    seen.push(*item);
                }
                seen
            }));
        }

        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                // Each item is delivered exactly once.
                assert!(all.insert(id));
            }
        }
        assert_eq!(all.len(), 100);
    }
}
