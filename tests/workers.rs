use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use fleetguard::error::PoolError;
use fleetguard::executor::BlockingTask;
use fleetguard::{PoolConfig, ResourcePool, TaskError, TaskExecutor};

fn task<T: Send + 'static>(f: impl FnOnce() -> Result<T, String> + Send + 'static) -> BlockingTask<T> {
    Box::new(move || f().map_err(Into::into))
}

#[tokio::test]
async fn batch_collects_every_outcome_when_tolerant() {
    let executor = TaskExecutor::new(4, Duration::from_secs(5));
    let tasks = vec![
        ("fetch".to_string(), task(|| Ok(1))),
        ("parse".to_string(), task(|| Err("bad input".to_string()))),
        ("index".to_string(), task(|| Ok(3))),
    ];

    let results = executor.run_many(tasks, true).await.unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(*results["fetch"].as_ref().unwrap(), 1);
    assert!(matches!(results["parse"], Err(TaskError::Failed(_))));
    assert_eq!(*results["index"].as_ref().unwrap(), 3);

    let stats = executor.stats();
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.failed, 1);
}

#[tokio::test]
async fn batch_aborts_on_first_failure() {
    let executor = TaskExecutor::new(4, Duration::from_secs(5));
    let tasks = vec![
        ("ok".to_string(), task(|| Ok(()))),
        ("broken".to_string(), task(|| Err("disk full".to_string()))),
    ];

    let err = executor.run_many(tasks, false).await.unwrap_err();
    assert_eq!(err.task, "broken");
    assert!(err.to_string().contains("disk full"));
}

#[tokio::test]
async fn deadline_covers_time_spent_queued() {
    let executor = TaskExecutor::new(1, Duration::from_secs(5));
    let busy = executor.clone();
    let hog = tokio::spawn(async move {
        busy.run(
            || {
                std::thread::sleep(Duration::from_millis(300));
                Ok::<_, std::io::Error>(())
            },
            None,
        )
        .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = executor
        .run(|| Ok::<_, std::io::Error>(()), Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(executor.stats().timed_out, 1);
    assert!(executor.stats().saturation_events >= 1);

    hog.await.unwrap().unwrap();
    assert!(executor.shutdown(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn panics_are_reported_not_propagated() {
    let executor = TaskExecutor::new(1, Duration::from_secs(5));
    let err = executor
        .run(|| -> Result<(), std::io::Error> { panic!("worker exploded") }, None)
        .await
        .unwrap_err();
    match err {
        TaskError::Panicked(msg) => assert!(msg.contains("worker exploded")),
        other => panic!("expected panic, got {other:?}"),
    }
    executor.run(|| Ok::<_, std::io::Error>(()), None).await.unwrap();
}

#[tokio::test]
async fn pool_bounds_and_reuses_resources() {
    let created = Arc::new(AtomicU32::new(0));
    let counter = created.clone();
    let pool = ResourcePool::new(
        "clients",
        move || {
            let id = counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, std::io::Error>(id) }
        },
        PoolConfig {
            max_size: 2,
            acquire_timeout: Duration::from_millis(50),
            ..Default::default()
        },
    );

    let first = pool.acquire().await.unwrap();
    let second = pool.acquire().await.unwrap();
    assert!(matches!(pool.acquire().await, Err(PoolError::Timeout(_))));

    let reused = *first;
    first.release();
    let again = pool.acquire().await.unwrap();
    assert_eq!(*again, reused);
    assert_eq!(again.info().use_count, 2);

    second.discard();
    let fresh = pool.acquire().await.unwrap();
    assert_eq!(*fresh, 2);

    let stats = pool.stats();
    assert_eq!(stats.total_created, 3);
    assert_eq!(stats.total_discarded, 1);
    assert_eq!(stats.total_timeouts, 1);
    assert_eq!(stats.in_use, 2);
    assert_eq!(created.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn waiter_gets_released_resource() {
    let pool = ResourcePool::new(
        "single",
        || async { Ok::<_, std::io::Error>(String::from("conn")) },
        PoolConfig {
            max_size: 1,
            acquire_timeout: Duration::from_secs(1),
            ..Default::default()
        },
    );
    let held = pool.acquire().await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await.map(|c| c.info().use_count) })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(held);

    assert_eq!(waiter.await.unwrap().unwrap(), 2);
    assert_eq!(pool.stats().total_created, 1);
}
