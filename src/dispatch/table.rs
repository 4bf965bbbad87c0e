use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use super::key::DispatchKey;
use super::signal::WorkSignal;

/// Per-key throttle state: the latest pending signal and when the key last ran.
struct KeySlot<K> {
    pending: Option<WorkSignal<K>>,
    last_run: Option<Instant>,
}

impl<K> Default for KeySlot<K> {
    fn default() -> Self {
        Self {
            pending: None,
            last_run: None,
        }
    }
}

/// Concurrent pending/last-run table shared by all dispatcher workers.
///
/// Uses `DashMap` so each key is independently lockable; there is no
/// table-wide mutex. Taking a pending signal and stamping its last-run
/// instant happen under the same entry guard, which is what keeps two
/// workers from dispatching one key in the same tick.
pub struct ThrottleTable<K: DispatchKey> {
    slots: DashMap<K, KeySlot<K>>,
    window: Duration,
}

impl<K: DispatchKey> ThrottleTable<K> {
    pub fn new(window: Duration) -> Self {
        Self {
            slots: DashMap::with_capacity(64),
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Stores `signal` as the pending work for its key.
    ///
    /// Returns `true` when an older pending signal was replaced.
    pub fn insert(&self, signal: WorkSignal<K>) -> bool {
        let mut slot = self.slots.entry(signal.key).or_default();
        slot.pending.replace(signal).is_some()
    }

    /// Keys that have pending work and whose window has elapsed at `now`.
    pub fn due_keys(&self, now: Instant) -> Vec<K> {
        self.slots
            .iter()
            .filter(|entry| {
                let slot = entry.value();
                slot.pending.is_some() && self.is_due(slot.last_run, now)
            })
            .map(|entry| *entry.key())
            .collect()
    }

    /// Removes and returns the pending signal for `key` if it is due at `now`,
    /// recording `now` as the key's last run.
    pub fn take_if_due(&self, key: K, now: Instant) -> Option<WorkSignal<K>> {
        let mut slot = self.slots.get_mut(&key)?;
        if slot.pending.is_none() || !self.is_due(slot.last_run, now) {
            return None;
        }

        let signal = slot.pending.take();
        slot.last_run = Some(now);
        signal
    }

    /// Removes every pending signal regardless of window.
    pub fn take_all_pending(&self, now: Instant) -> Vec<WorkSignal<K>> {
        let keys: Vec<K> = self
            .slots
            .iter()
            .filter(|entry| entry.value().pending.is_some())
            .map(|entry| *entry.key())
            .collect();

        let mut taken = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(mut slot) = self.slots.get_mut(&key) {
                if let Some(signal) = slot.pending.take() {
                    slot.last_run = Some(now);
                    taken.push(signal);
                }
            }
        }
        taken
    }

    /// Number of keys with pending work.
    pub fn pending_len(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| entry.value().pending.is_some())
            .count()
    }

    /// Number of keys ever seen.
    pub fn tracked_keys(&self) -> usize {
        self.slots.len()
    }

    fn is_due(&self, last_run: Option<Instant>, now: Instant) -> bool {
        match last_run {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.window,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(key: u32) -> WorkSignal<u32> {
        WorkSignal::new(key, || async { Ok(()) })
    }

    #[test]
    fn test_insert_coalesces_same_key() {
        let table = ThrottleTable::new(Duration::from_secs(5));

        assert!(!table.insert(signal(1)));
        assert!(table.insert(signal(1)));
        assert!(!table.insert(signal(2)));

        assert_eq!(table.pending_len(), 2);
        assert_eq!(table.tracked_keys(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_if_due_keeps_latest_signal() {
        let table = ThrottleTable::new(Duration::from_secs(5));

        let first = signal(1);
        tokio::time::advance(Duration::from_millis(10)).await;
        let second = signal(1);
        let second_at = second.submitted_at;

        table.insert(first);
        table.insert(second);

        let now = Instant::now();
        let taken = table.take_if_due(1, now).expect("never-run key is due");
        assert_eq!(taken.submitted_at, second_at);
        assert_eq!(table.pending_len(), 0);
        assert!(table.take_if_due(1, now).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_blocks_until_elapsed() {
        let window = Duration::from_secs(5);
        let table = ThrottleTable::new(window);
        let start = Instant::now();

        table.insert(signal(1));
        assert!(table.take_if_due(1, start).is_some());

        table.insert(signal(1));
        assert!(table.due_keys(start + Duration::from_secs(4)).is_empty());
        assert!(table
            .take_if_due(1, start + Duration::from_secs(4))
            .is_none());
        assert_eq!(table.pending_len(), 1);

        assert_eq!(table.due_keys(start + window), vec![1]);
        assert!(table.take_if_due(1, start + window).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_have_independent_windows() {
        let window = Duration::from_secs(5);
        let table = ThrottleTable::new(window);
        let start = Instant::now();

        table.insert(signal(1));
        assert!(table.take_if_due(1, start).is_some());

        let later = start + Duration::from_secs(1);
        table.insert(signal(1));
        table.insert(signal(2));

        assert_eq!(table.due_keys(later), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_tick_does_not_rewind_last_run() {
        let table = ThrottleTable::new(Duration::from_secs(5));
        let start = Instant::now();

        table.insert(signal(1));
        assert!(table.take_if_due(1, start + Duration::from_secs(10)).is_some());

        // A worker holding an older tick instant must not see the key as due.
        table.insert(signal(1));
        assert!(table.take_if_due(1, start).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_all_pending_ignores_window() {
        let table = ThrottleTable::new(Duration::from_secs(60));
        let now = Instant::now();

        table.insert(signal(1));
        assert!(table.take_if_due(1, now).is_some());
        table.insert(signal(1));
        table.insert(signal(2));

        let mut keys: Vec<u32> = table
            .take_all_pending(now)
            .into_iter()
            .map(|s| s.key)
            .collect();
        keys.sort_unstable();

        assert_eq!(keys, vec![1, 2]);
        assert_eq!(table.pending_len(), 0);
    }
}
