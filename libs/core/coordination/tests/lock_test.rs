//! Multi-contender lock behaviour against the in-memory backend

use coordination::{DistributedLock, LockOptions, MemoryEnsemble, MemorySession};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

async fn contender(ensemble: &MemoryEnsemble, resource: &str) -> DistributedLock<MemorySession> {
    DistributedLock::new(Arc::new(ensemble.connect()), resource)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_waiters_acquire_in_arrival_order() {
    let ensemble = MemoryEnsemble::new();
    let mut holder = contender(&ensemble, "orders").await;
    holder.lock().await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();

    for id in 0..4 {
        let mut lock = contender(&ensemble, "orders").await;
        let order = order.clone();
        handles.push(tokio::spawn(async move {
            lock.lock().await.unwrap();
            order.lock().await.push(id);
            lock.unlock().await.unwrap();
        }));

        // Wait until this contender's node is queued before starting the next
        let expected = id + 2;
        while ensemble.child_names("/distributed_locks/orders").len() < expected {
            tokio::task::yield_now().await;
        }
    }

    holder.unlock().await.unwrap();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(*order.lock().await, vec![0, 1, 2, 3]);
    assert!(ensemble.child_names("/distributed_locks/orders").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_holder() {
    let ensemble = MemoryEnsemble::new();
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for _ in 0..8 {
        let mut lock = contender(&ensemble, "inventory").await;
        let inside = inside.clone();
        let max_inside = max_inside.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..3 {
                lock.lock().await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                lock.unlock().await.unwrap();
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_lock_available_after_unlock() {
    let ensemble = MemoryEnsemble::new();
    let mut first = contender(&ensemble, "payments").await;
    let mut second = contender(&ensemble, "payments").await;

    first.lock().await.unwrap();
    first.unlock().await.unwrap();

    second
        .lock_with_timeout(Duration::from_millis(100))
        .await
        .unwrap();
    assert!(second.is_held());
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_waiter_does_not_block_later_waiters() {
    let ensemble = MemoryEnsemble::new();
    let mut holder = contender(&ensemble, "sku-7").await;
    holder.lock().await.unwrap();

    let short = LockOptions::default().with_wait_timeout(Duration::from_secs(1));
    let mut impatient =
        DistributedLock::with_options(Arc::new(ensemble.connect()), "sku-7", short)
            .await
            .unwrap();
    let mut patient = contender(&ensemble, "sku-7").await;

    let impatient_handle = tokio::spawn(async move { impatient.lock().await });
    while ensemble.child_names("/distributed_locks/sku-7").len() < 2 {
        tokio::task::yield_now().await;
    }
    let patient_handle = tokio::spawn(async move { patient.lock().await.map(|()| patient) });

    assert!(impatient_handle.await.unwrap().unwrap_err().is_timeout());

    holder.unlock().await.unwrap();
    let patient = patient_handle.await.unwrap().unwrap();
    assert!(patient.is_held());
}

#[tokio::test]
async fn test_custom_root() {
    let ensemble = MemoryEnsemble::new();
    let options = LockOptions::default().with_root("/services/relay/locks");
    let mut lock = DistributedLock::with_options(Arc::new(ensemble.connect()), "leader", options)
        .await
        .unwrap();

    lock.lock().await.unwrap();
    assert!(ensemble.exists("/services/relay/locks/leader"));
    assert_eq!(ensemble.child_names("/services/relay/locks/leader").len(), 1);
    lock.unlock().await.unwrap();
}
