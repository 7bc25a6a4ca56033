use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

use crate::elterm::StatusObject;

/// Minimum spacing between two snapshots handed to observers.
pub const THROTTLE_INTERVAL: Duration = Duration::from_secs(2);

/// Rate limiter for status snapshots.
///
/// Holds at most one deferred snapshot. Newer offers replace it, so the
/// deferred publish always carries the latest object.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last_publish: Option<Instant>,
    deferred: Option<StatusObject>,
    deadline: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_publish: None,
            deferred: None,
            deadline: None,
        }
    }

    /// Offer a snapshot. Returns it back if it should be published now.
    pub fn offer(&mut self, obj: StatusObject, now: Instant) -> Option<StatusObject> {
        let due = match self.last_publish {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        };

        if due {
            self.last_publish = Some(now);
            self.deferred = None;
            self.deadline = None;
            return Some(obj);
        }

        self.deferred = Some(obj);
        if self.deadline.is_none() {
            self.deadline = self.last_publish.map(|last| last + self.interval);
        }
        None
    }

    /// When the deferred snapshot is due, if one is waiting.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Release the deferred snapshot once its deadline has passed.
    pub fn fire(&mut self, now: Instant) -> Option<StatusObject> {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                let obj = self.deferred.take()?;
                self.last_publish = Some(now);
                Some(obj)
            }
            _ => None,
        }
    }

    /// Drop the timer and hand back whatever was still deferred.
    pub fn flush(&mut self) -> Option<StatusObject> {
        self.deadline = None;
        self.deferred.take()
    }
}

/// Forward snapshots from `rx` to `tx`, at most one per `interval`.
///
/// Ends when either side closes. A snapshot still deferred when `rx`
/// closes is delivered before returning.
pub async fn run(
    mut rx: mpsc::Receiver<StatusObject>,
    tx: mpsc::Sender<StatusObject>,
    interval: Duration,
) {
    let mut throttle = Throttle::new(interval);

    loop {
        let deadline = throttle.deadline();
        let ready = tokio::select! {
            msg = rx.recv() => match msg {
                Some(obj) => throttle.offer(obj, Instant::now()),
                None => {
                    if let Some(obj) = throttle.flush() {
                        let _ = tx.send(obj).await;
                    }
                    debug!("Status channel closed, notifier stopping");
                    return;
                }
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                throttle.fire(Instant::now())
            }
        };

        if let Some(obj) = ready {
            if tx.send(obj).await.is_err() {
                warn!("Snapshot observer channel closed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(n: u64) -> StatusObject {
        json!({"FrameType": "SkzpData", "Seq": n})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_first_offer_is_immediate() {
        let mut throttle = Throttle::new(THROTTLE_INTERVAL);
        assert!(throttle.offer(snapshot(1), Instant::now()).is_some());
        assert!(throttle.deadline().is_none());
    }

    #[test]
    fn test_burst_defers_latest() {
        let start = Instant::now();
        let mut throttle = Throttle::new(THROTTLE_INTERVAL);
        assert!(throttle.offer(snapshot(1), start).is_some());

        for n in 2..=5 {
            let at = start + Duration::from_millis(100 * n);
            assert!(throttle.offer(snapshot(n), at).is_none());
        }
        assert_eq!(throttle.deadline(), Some(start + THROTTLE_INTERVAL));

        assert!(throttle.fire(start + Duration::from_secs(1)).is_none());
        let fired = throttle.fire(start + THROTTLE_INTERVAL).unwrap();
        assert_eq!(fired["Seq"], json!(5));
        assert!(throttle.deadline().is_none());
    }

    #[test]
    fn test_offer_after_interval_is_immediate() {
        let start = Instant::now();
        let mut throttle = Throttle::new(THROTTLE_INTERVAL);
        throttle.offer(snapshot(1), start);
        let later = start + Duration::from_millis(2500);
        assert!(throttle.offer(snapshot(2), later).is_some());
        assert!(throttle.offer(snapshot(3), later + Duration::from_millis(10)).is_none());
        assert_eq!(throttle.deadline(), Some(later + THROTTLE_INTERVAL));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ten_in_200ms_yields_two_publishes() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let task = tokio::spawn(run(in_rx, out_tx, THROTTLE_INTERVAL));

        for n in 0..10 {
            in_tx.send(snapshot(n)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_secs(3)).await;

        let mut seen = Vec::new();
        while let Ok(obj) = out_rx.try_recv() {
            seen.push(obj["Seq"].as_u64().unwrap());
        }
        assert_eq!(seen, vec![0, 9]);

        drop(in_tx);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_is_flushed_on_close() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let task = tokio::spawn(run(in_rx, out_tx, THROTTLE_INTERVAL));

        in_tx.send(snapshot(1)).await.unwrap();
        in_tx.send(snapshot(2)).await.unwrap();
        drop(in_tx);
        task.await.unwrap();

        assert_eq!(out_rx.recv().await.unwrap()["Seq"], json!(1));
        assert_eq!(out_rx.recv().await.unwrap()["Seq"], json!(2));
        assert!(out_rx.recv().await.is_none());
    }
}
