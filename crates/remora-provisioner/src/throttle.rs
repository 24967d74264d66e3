use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Cooperative cap on in-flight provision and delete chains.
///
/// Callers park until the relevant counter sits below its cap, then
/// increment it and hold a guard for the lifetime of the chain. The
/// re-test sleep is randomised so a storm of parked chains does not
/// thunder back in lockstep. This is intentionally not a hard gate:
/// the caps are small and approximate admission is enough.
pub struct Throttle {
    provisions: AtomicU32,
    deletes: AtomicU32,
    parked: AtomicU32,
    max_provisions: u32,
    max_deletes: u32,
}

/// Holds one slot of a throttle counter; dropping it releases the slot.
pub struct ThrottleGuard<'a> {
    counter: &'a AtomicU32,
}

impl Throttle {
    pub fn new(max_provisions: u32, max_deletes: u32) -> Self {
        Self {
            provisions: AtomicU32::new(0),
            deletes: AtomicU32::new(0),
            parked: AtomicU32::new(0),
            max_provisions,
            max_deletes,
        }
    }

    /// Park until a provision slot is free, then take it.
    pub async fn acquire_provision(&self) -> ThrottleGuard<'_> {
        self.limit(&self.provisions, self.max_provisions).await;
        self.provisions.fetch_add(1, Ordering::SeqCst);
        ThrottleGuard {
            counter: &self.provisions,
        }
    }

    /// Park until a delete slot is free, then take it.
    pub async fn acquire_delete(&self) -> ThrottleGuard<'_> {
        self.limit(&self.deletes, self.max_deletes).await;
        self.deletes.fetch_add(1, Ordering::SeqCst);
        ThrottleGuard {
            counter: &self.deletes,
        }
    }

    pub fn provisions(&self) -> u32 {
        self.provisions.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> u32 {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn parked(&self) -> u32 {
        self.parked.load(Ordering::SeqCst)
    }

    async fn limit(&self, watched: &AtomicU32, max: u32) {
        if watched.load(Ordering::SeqCst) < max {
            return;
        }
        self.parked.fetch_add(1, Ordering::SeqCst);
        while watched.load(Ordering::SeqCst) >= max {
            let jitter = rand::thread_rng().gen_range(0..1000);
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }
        self.parked.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for ThrottleGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_guard_releases_slot() {
        let throttle = Arc::new(Throttle::new(4, 10));
        {
            let _guard = throttle.acquire_provision().await;
            assert_eq!(throttle.provisions(), 1);
        }
        assert_eq!(throttle.provisions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parks_at_cap_and_resumes() {
        let throttle = Arc::new(Throttle::new(1, 10));
        let first = throttle.acquire_provision().await;
        assert_eq!(throttle.provisions(), 1);

        let contender = {
            let throttle = Arc::clone(&throttle);
            tokio::spawn(async move {
                let _guard = throttle.acquire_provision().await;
                throttle.provisions()
            })
        };

        // let the contender reach the parked loop
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(throttle.parked(), 1);

        drop(first);
        let held = contender.await.unwrap();
        assert_eq!(held, 1);
        assert_eq!(throttle.parked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_and_delete_caps_are_independent() {
        let throttle = Arc::new(Throttle::new(1, 1));
        let _provision = throttle.acquire_provision().await;
        // a delete slot is still free even though provisions are full
        let _delete = throttle.acquire_delete().await;
        assert_eq!(throttle.provisions(), 1);
        assert_eq!(throttle.deletes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_never_exceeds_cap() {
        let throttle = Arc::new(Throttle::new(2, 10));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let throttle = Arc::clone(&throttle);
            handles.push(tokio::spawn(async move {
                let _guard = throttle.acquire_provision().await;
                let seen = throttle.provisions();
                tokio::time::sleep(Duration::from_millis(10)).await;
                seen
            }));
        }
        for handle in handles {
            let seen = handle.await.unwrap();
            assert!(seen <= 2, "saw {} in-flight provisions", seen);
        }
        assert_eq!(throttle.provisions(), 0);
    }
}
