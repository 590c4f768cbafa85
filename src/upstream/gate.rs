use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Single-lane admission gate: successive `wait()` returns are separated by
/// at least the configured gap, in caller arrival order (tokio mutexes queue
/// waiters fairly). A caller failing after admission cannot wedge the lane;
/// the next waiter is admitted a full gap after the previous admission.
pub struct RateGate {
    min_gap: Duration,
    lane: Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(min_gap_ms: u64) -> Self {
        Self {
            min_gap: Duration::from_millis(min_gap_ms),
            lane: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        let mut last = self.lane.lock().await;
        if let Some(prev) = *last {
            let due = prev + self.min_gap;
            let now = Instant::now();
            if due > now {
                tokio::time::sleep(due - now).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn enforces_minimum_gap_between_admissions() {
        let gate = Arc::new(RateGate::new(50));
        let start = Instant::now();
        let mut stamps = Vec::new();
        for _ in 0..4 {
            gate.wait().await;
            stamps.push(start.elapsed());
        }
        for pair in stamps.windows(2) {
            assert!(
                pair[1] - pair[0] >= Duration::from_millis(45),
                "admissions too close: {:?}",
                pair
            );
        }
    }

    #[tokio::test]
    async fn concurrent_waiters_are_serialized() {
        let gate = Arc::new(RateGate::new(30));
        let mut handles = Vec::new();
        for _ in 0..5 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                gate.wait().await;
                Instant::now()
            }));
        }
        let mut stamps = Vec::new();
        for handle in handles {
            stamps.push(handle.await.expect("waiter"));
        }
        stamps.sort();
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(25));
        }
    }

    #[tokio::test]
    async fn lane_survives_a_failing_caller() {
        let gate = Arc::new(RateGate::new(20));
        gate.wait().await;
        // Simulate an operation that panics after admission in its own task.
        let failing = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.wait().await;
                panic!("operation failed after admission");
            })
        };
        assert!(failing.await.is_err());
        // The lane must still admit the next waiter.
        let before = Instant::now();
        gate.wait().await;
        assert!(before.elapsed() < Duration::from_millis(100));
    }
}
