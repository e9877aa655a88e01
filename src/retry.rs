use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Bounded exponential backoff for ICE restarts. The first retry is
/// immediate, later ones wait `base`, `2 * base`, ...
#[derive(Debug, Clone)]
pub struct Backoff {
    attempts: u32,
    limit: u32,
    base: Duration,
}

impl Backoff {
    pub fn new(limit: u32, base: Duration) -> Self {
        Self {
            attempts: 0,
            limit,
            base,
        }
    }

    /// Records a failure. Returns how long to wait before retrying, or `None`
    /// once the attempts are used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.limit {
            return None;
        }
        self.attempts += 1;
        Some(match self.attempts {
            1 => Duration::ZERO,
            n => self.base * 2u32.saturating_pow(n - 2),
        })
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Messages that arrived before the session could handle them, replayed in
/// arrival order once it can. Entries older than `staleness` are dropped.
#[derive(Debug)]
pub struct PendingQueue<T> {
    entries: VecDeque<(Instant, T)>,
    staleness: Duration,
}

impl<T> PendingQueue<T> {
    pub fn new(staleness: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            staleness,
        }
    }

    pub fn push(&mut self, item: T) {
        self.entries.push_back((Instant::now(), item));
    }

    pub fn drain_fresh(&mut self) -> Vec<T> {
        let now = Instant::now();
        let mut fresh = Vec::with_capacity(self.entries.len());
        let mut stale = 0;
        for (queued, item) in self.entries.drain(..) {
            if now.duration_since(queued) > self.staleness {
                stale += 1;
            } else {
                fresh.push(item);
            }
        }
        if stale > 0 {
            debug!("Dropped {} stale pending messages", stale);
        }
        fresh
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
