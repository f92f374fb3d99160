//! Ticker manager: shared, optionally phase-aligned tick sources.
//!
//! Subscribers at the same `(period, synchronized)` pair share one
//! underlying timer. Delivery is `try_send` on a depth-1 channel: a
//! subscriber that does not drain promptly loses ticks at the manager, it
//! never accumulates debt.

use chrono::{DateTime, Utc};
use sqlmon_common::task::TaskHandle;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

pub type SubId = u64;

pub struct TickSubscription {
    pub id: SubId,
    pub rx: mpsc::Receiver<DateTime<Utc>>,
}

type SubMap = Arc<Mutex<HashMap<SubId, mpsc::Sender<DateTime<Utc>>>>>;

struct Group {
    subs: SubMap,
    task: TaskHandle,
}

#[derive(Default)]
struct Inner {
    next_id: SubId,
    groups: HashMap<(u64, bool), Group>,
    index: HashMap<SubId, (u64, bool)>,
}

#[derive(Default)]
pub struct TickerManager {
    inner: Mutex<Inner>,
}

/// Seconds until the next wall-clock multiple of `period`, so that two
/// synchronized subscribers on different hosts tick at the same instant.
pub fn initial_delay(now_secs: i64, period: u64) -> u64 {
    period - (now_secs.rem_euclid(period as i64) as u64)
}

impl TickerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begins delivering ticks at `period` seconds until
    /// [`TickerManager::unsubscribe`].
    pub fn subscribe(&self, period: u64, synchronized: bool) -> TickSubscription {
        let period = period.max(1);
        let (tx, rx) = mpsc::channel(1);
        let mut inner = self.inner.lock().expect("ticker poisoned");
        inner.next_id += 1;
        let id = inner.next_id;

        let group = inner.groups.entry((period, synchronized)).or_insert_with(|| {
            let subs: SubMap = Arc::new(Mutex::new(HashMap::new()));
            let task_subs = subs.clone();
            let task = TaskHandle::spawn(move |stop| async move {
                run_group(period, synchronized, task_subs, stop).await;
            });
            Group { subs, task }
        });
        group.subs.lock().expect("ticker poisoned").insert(id, tx);
        inner.index.insert(id, (period, synchronized));
        TickSubscription { id, rx }
    }

    /// Stops delivery and releases the shared timer once its last
    /// subscriber is gone.
    pub fn unsubscribe(&self, id: SubId) {
        let mut inner = self.inner.lock().expect("ticker poisoned");
        let Some(key) = inner.index.remove(&id) else {
            return;
        };
        let empty = match inner.groups.get(&key) {
            Some(group) => {
                let mut subs = group.subs.lock().expect("ticker poisoned");
                subs.remove(&id);
                subs.is_empty()
            }
            None => false,
        };
        if empty {
            if let Some(group) = inner.groups.remove(&key) {
                group.task.signal();
            }
        }
    }

    /// Number of live subscriptions, for status reporting.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("ticker poisoned").index.len()
    }
}

async fn run_group(
    period: u64,
    synchronized: bool,
    subs: SubMap,
    mut stop: tokio::sync::watch::Receiver<bool>,
) {
    let period_d = Duration::from_secs(period);
    let first = if synchronized {
        Duration::from_secs(initial_delay(Utc::now().timestamp(), period))
    } else {
        period_d
    };
    let mut timer = interval_at(Instant::now() + first, period_d);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = timer.tick() => {
                let secs = Utc::now().timestamp();
                let secs = if synchronized {
                    // Snap to the boundary; scheduler jitter lands us just
                    // after it.
                    secs - secs.rem_euclid(period as i64)
                } else {
                    secs
                };
                let Some(ts) = DateTime::from_timestamp(secs, 0) else {
                    continue;
                };
                let senders: Vec<_> = {
                    let subs = subs.lock().expect("ticker poisoned");
                    subs.values().cloned().collect()
                };
                for tx in senders {
                    // Full channel means the subscriber missed this tick.
                    let _ = tx.try_send(ts);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_delay_aligns_to_period() {
        assert_eq!(initial_delay(1_700_000_007, 10), 3);
        assert_eq!(initial_delay(1_700_000_000, 10), 10);
        assert_eq!(initial_delay(1_700_000_009, 10), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn synchronized_ticks_land_on_period_boundary() {
        let ticker = TickerManager::new();
        let mut sub = ticker.subscribe(10, true);
        let ts = sub.rx.recv().await.unwrap();
        assert_eq!(ts.timestamp() % 10, 0);
        ticker.unsubscribe(sub.id);
    }

    #[tokio::test(start_paused = true)]
    async fn same_period_subscribers_share_ticks() {
        let ticker = TickerManager::new();
        let mut a = ticker.subscribe(5, true);
        let mut b = ticker.subscribe(5, true);
        assert_eq!(ticker.subscriber_count(), 2);

        let ta = a.rx.recv().await.unwrap();
        let tb = b.rx.recv().await.unwrap();
        assert_eq!(ta, tb);

        ticker.unsubscribe(a.id);
        ticker.unsubscribe(b.id);
        assert_eq!(ticker.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_subscriber_loses_ticks() {
        let ticker = TickerManager::new();
        let mut sub = ticker.subscribe(1, false);

        // Let several periods elapse without draining; only one tick can be
        // queued on the depth-1 channel.
        tokio::time::sleep(Duration::from_secs(5)).await;
        let first = sub.rx.recv().await.unwrap();
        let queued = sub.rx.try_recv();
        assert!(queued.is_err() || queued.unwrap() > first);
        ticker.unsubscribe(sub.id);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_stops_delivery() {
        let ticker = TickerManager::new();
        let mut sub = ticker.subscribe(1, false);
        sub.rx.recv().await.unwrap();
        ticker.unsubscribe(sub.id);

        tokio::time::sleep(Duration::from_secs(3)).await;
        // At most one tick could have raced the unsubscribe.
        let mut extra = 0;
        while sub.rx.try_recv().is_ok() {
            extra += 1;
        }
        assert!(extra <= 1);
    }
}
