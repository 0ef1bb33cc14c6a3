use std::{
    collections::{HashMap, VecDeque},
    hash::Hash,
    sync::Mutex,
    time::{Duration, Instant},
};

/// Per-key event counters over a fixed trailing time span.
#[derive(Debug)]
pub struct SlidingWindow<K> {
    span: Duration,
    events: Mutex<HashMap<K, VecDeque<Instant>>>,
}

impl<K: Eq + Hash> SlidingWindow<K> {
    pub fn new(span: Duration) -> Self {
        Self {
            span,
            events: Mutex::new(HashMap::new()),
        }
    }

    pub fn span(&self) -> Duration {
        self.span
    }

    /// Records an event at `now` and returns how many events for `key` fall
    /// inside `(now - span, now]`.
    pub fn hit(&self, key: K, now: Instant) -> usize {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        let queue = events.entry(key).or_default();
        queue.push_back(now);
        while let Some(&oldest) = queue.front() {
            if now.saturating_duration_since(oldest) >= self.span {
                queue.pop_front();
            } else {
                break;
            }
        }
        queue.len()
    }

    pub fn reset(&self, key: &K) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.remove(key);
    }

    /// Drops keys whose newest event is already outside the window.
    pub fn prune(&self, now: Instant) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.retain(|_, queue| {
            queue
                .back()
                .is_some_and(|&newest| now.saturating_duration_since(newest) < self.span)
        });
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_only_recent_events() {
        let window = SlidingWindow::new(Duration::from_secs(10));
        let start = Instant::now();
        assert_eq!(window.hit("a", start), 1);
        assert_eq!(window.hit("a", start + Duration::from_secs(3)), 2);
        assert_eq!(window.hit("a", start + Duration::from_secs(9)), 3);
        // the first event is exactly one span old and drops out
        assert_eq!(window.hit("a", start + Duration::from_secs(10)), 3);
        assert_eq!(window.hit("a", start + Duration::from_secs(25)), 1);
    }

    #[test]
    fn keys_are_independent() {
        let window = SlidingWindow::new(Duration::from_secs(5));
        let now = Instant::now();
        window.hit((1u64, 2u64), now);
        window.hit((1u64, 2u64), now);
        assert_eq!(window.hit((1u64, 3u64), now), 1);
        assert_eq!(window.hit((1u64, 2u64), now), 3);
    }

    #[test]
    fn reset_and_prune() {
        let window = SlidingWindow::new(Duration::from_secs(5));
        let now = Instant::now();
        window.hit(1, now);
        window.hit(2, now + Duration::from_secs(4));
        window.reset(&1);
        assert_eq!(window.hit(1, now + Duration::from_secs(4)), 1);

        window.hit(3, now);
        window.prune(now + Duration::from_secs(6));
        assert_eq!(window.len(), 2);
    }
}
