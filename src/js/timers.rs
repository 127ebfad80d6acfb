use std::collections::BTreeMap;

const MIN_INTERVAL_MS: u64 = 1;

#[derive(Debug, Clone, Copy)]
struct TimerEntry {
    due_at: u64,
    interval: Option<u64>,
}

/// Timers on a virtual clock.
///
/// Time only moves when [`TimerQueue::advance`] is called, so page scripts
/// that rely on `setTimeout`/`setInterval` run deterministically.
#[derive(Debug, Default)]
pub struct TimerQueue {
    now: u64,
    next_id: u32,
    timers: BTreeMap<u32, TimerEntry>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn schedule(&mut self, delay_ms: f64, repeating: bool) -> u32 {
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let delay = if delay_ms.is_finite() && delay_ms > 0.0 {
            delay_ms as u64
        } else {
            0
        };
        let interval = repeating.then(|| delay.max(MIN_INTERVAL_MS));
        self.timers.insert(
            self.next_id,
            TimerEntry {
                due_at: self.now + interval.unwrap_or(delay),
                interval,
            },
        );
        self.next_id
    }

    pub fn clear(&mut self, id: u32) {
        self.timers.remove(&id);
    }

    pub fn has_pending(&self) -> bool {
        !self.timers.is_empty()
    }

    /// Pop the earliest timer due no later than `deadline`, moving the clock
    /// to its due time. Repeating timers are rescheduled.
    pub fn next_due(&mut self, deadline: u64) -> Option<u32> {
        let (id, entry) = self
            .timers
            .iter()
            .filter(|(_, entry)| entry.due_at <= deadline)
            .min_by_key(|(id, entry)| (entry.due_at, **id))
            .map(|(id, entry)| (*id, *entry))?;

        self.now = self.now.max(entry.due_at);
        match entry.interval {
            Some(interval) => {
                if let Some(timer) = self.timers.get_mut(&id) {
                    timer.due_at = entry.due_at + interval;
                }
            }
            None => {
                self.timers.remove(&id);
            }
        }
        Some(id)
    }

    /// Move the clock to `deadline` once nothing else is due.
    pub fn settle_at(&mut self, deadline: u64) {
        self.now = self.now.max(deadline);
    }

    pub fn clear_all(&mut self) {
        self.timers.clear();
    }
}
