//! End-to-end scenarios against the in-memory store: real dispatch loops,
//! real timers, shared-store multi-instance coordination.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Timelike, Utc};
use monque::testing::MemoryJobStore;
use monque::{
    Job, JobEvent, JobStatus, Monque, MonqueConfig, WorkerOptions,
};
use serde_json::json;
use uuid::Uuid;

fn fast_config() -> MonqueConfig {
    MonqueConfig::builder()
        .poll_interval(Duration::from_millis(20))
        .build()
}

fn instance(store: &Arc<MemoryJobStore>, config: MonqueConfig) -> Monque {
    Monque::with_store(store.clone(), config)
}

/// Give the event collector task a beat to drain the channel.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

/// Poll until `f` holds or the deadline passes.
async fn wait_until(deadline: Duration, f: impl Fn() -> bool) -> bool {
    let until = tokio::time::Instant::now() + deadline;
    while tokio::time::Instant::now() < until {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    f()
}

/// Collect every event into a shared vector.
fn collect_events(monque: &Monque) -> Arc<Mutex<Vec<JobEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let mut rx = monque.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            sink.lock().unwrap().push(event);
        }
    });
    events
}

#[tokio::test]
async fn jobs_run_to_completion() {
    let store = Arc::new(MemoryJobStore::new());
    let monque = instance(&store, fast_config());
    let events = collect_events(&monque);

    let ran = Arc::new(AtomicUsize::new(0));
    let ran_handler = ran.clone();
    monque
        .register("send-email", move |_job: Job| {
            let ran = ran_handler.clone();
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

    monque.start().await.unwrap();
    let job = monque.now("send-email", json!({"to": "a@example.com"})).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || {
            store.job(job.id).map(|j| j.status) == Some(JobStatus::Completed)
        })
        .await
    );
    monque.stop().await.unwrap();

    assert_eq!(ran.load(Ordering::SeqCst), 1);
    let done = store.job(job.id).unwrap();
    assert!(!done.is_leased());
    assert!(done.last_heartbeat.is_none());

    settle().await;
    let events = events.lock().unwrap();
    assert!(events.iter().any(|e| matches!(e, JobEvent::Started { job: j } if j.id == job.id)));
    assert!(events
        .iter()
        .any(|e| matches!(e, JobEvent::Completed { job: j, .. } if j.id == job.id)));
}

#[tokio::test]
async fn one_time_success_preserves_fail_count() {
    let store = Arc::new(MemoryJobStore::new());
    let monque = instance(&store, fast_config());

    // A job that already failed twice and then succeeds keeps its failure
    // history on the completed record.
    let mut job = Job::builder().name("flaky").build();
    job.fail_count = 2;
    job.fail_reason = Some("earlier attempt".into());
    store.put(job.clone());

    monque.register("flaky", |_job: Job| async move { Ok(()) }).unwrap();
    monque.start().await.unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || {
            store.job(job.id).map(|j| j.status) == Some(JobStatus::Completed)
        })
        .await
    );
    monque.stop().await.unwrap();

    let done = store.job(job.id).unwrap();
    assert_eq!(done.fail_count, 2);
    assert!(done.fail_reason.is_none());
}

#[tokio::test]
async fn failing_jobs_back_off_exponentially_then_fail_terminally() {
    let store = Arc::new(MemoryJobStore::new());
    let config = MonqueConfig::builder()
        .poll_interval(Duration::from_millis(20))
        .max_retries(3)
        .base_retry_interval(Duration::from_millis(200))
        .build();
    let monque = instance(&store, config);
    let events = collect_events(&monque);

    monque
        .register("doomed", |_job: Job| async move {
            Err(anyhow::anyhow!("database exploded"))
        })
        .unwrap();

    monque.start().await.unwrap();
    let job = monque.now("doomed", json!({})).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(10), || {
            store.job(job.id).map(|j| j.status) == Some(JobStatus::Failed)
        })
        .await
    );
    monque.stop().await.unwrap();

    let failed = store.job(job.id).unwrap();
    assert_eq!(failed.fail_count, 3);
    assert_eq!(failed.fail_reason.as_deref(), Some("database exploded"));
    assert!(!failed.is_leased());

    settle().await;
    let events = events.lock().unwrap();
    let fail_events: Vec<(i32, bool)> = events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Failed {
                job, will_retry, ..
            } if job.id == failed.id => Some((job.fail_count, *will_retry)),
            _ => None,
        })
        .collect();
    assert_eq!(fail_events, vec![(1, true), (2, true), (3, false)]);

    // Backoff delays recorded on the retried records: 2^n * base.
    for (fail_count, will_retry) in &fail_events {
        if !will_retry {
            continue;
        }
        let expected_ms = 2i64.pow(*fail_count as u32) * 200;
        let recorded = events
            .iter()
            .find_map(|e| match e {
                JobEvent::Failed { job, .. } if job.fail_count == *fail_count => {
                    Some((job.next_run_at - job.updated_at).num_milliseconds())
                }
                _ => None,
            })
            .unwrap();
        assert!(
            (recorded - expected_ms).abs() <= 200,
            "fail_count {fail_count}: recorded delay {recorded} ms, expected ~{expected_ms} ms"
        );
    }
}

#[tokio::test]
async fn three_instances_share_the_queue_without_duplicates() {
    let store = Arc::new(MemoryJobStore::new());
    let seen = Arc::new(Mutex::new(Vec::<Uuid>::new()));

    let mut instances = Vec::new();
    for _ in 0..3 {
        let monque = instance(&store, fast_config());
        let seen = seen.clone();
        monque
            .register("work", move |job: Job| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(job.id);
                    Ok(())
                }
            })
            .unwrap();
        monque.start().await.unwrap();
        instances.push(monque);
    }

    let producer = &instances[0];
    let mut ids = Vec::new();
    for i in 0..60 {
        let job = producer.now("work", json!({"n": i})).await.unwrap();
        ids.push(job.id);
    }

    assert!(
        wait_until(Duration::from_secs(10), || {
            store
                .jobs()
                .iter()
                .all(|j| j.status == JobStatus::Completed)
        })
        .await
    );
    for monque in &instances {
        monque.stop().await.unwrap();
    }

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 60, "every job ran exactly once");
    let unique: std::collections::HashSet<_> = seen.iter().collect();
    assert_eq!(unique.len(), 60);
    for id in &ids {
        assert!(unique.contains(id));
    }
}

#[tokio::test]
async fn recurring_jobs_return_to_pending_on_the_next_occurrence() {
    let store = Arc::new(MemoryJobStore::new());
    let monque = instance(&store, fast_config());

    monque.register("hourly", |_job: Job| async move { Ok(()) }).unwrap();
    monque.init().await.unwrap();

    let job = monque
        .schedule("0 * * * *", "hourly", json!({}), Default::default())
        .await
        .unwrap();

    // Make it due now; give it some failure history to confirm the reset.
    let mut due = store.job(job.id).unwrap();
    due.next_run_at = Utc::now() - chrono::Duration::seconds(1);
    due.fail_count = 4;
    due.fail_reason = Some("flaked last week".into());
    store.put(due);

    monque.start().await.unwrap();
    assert!(
        wait_until(Duration::from_secs(3), || {
            store
                .job(job.id)
                .is_some_and(|j| j.status == JobStatus::Pending && j.next_run_at > Utc::now())
        })
        .await
    );
    monque.stop().await.unwrap();

    let rescheduled = store.job(job.id).unwrap();
    assert_eq!(rescheduled.status, JobStatus::Pending);
    assert_eq!(rescheduled.fail_count, 0);
    assert!(rescheduled.fail_reason.is_none());
    assert_eq!(rescheduled.repeat_interval.as_deref(), Some("0 * * * *"));
    assert_eq!(rescheduled.next_run_at.minute(), 0);
    assert!(!rescheduled.is_leased());
}

#[tokio::test]
async fn graceful_stop_waits_for_the_active_handler() {
    let store = Arc::new(MemoryJobStore::new());
    let config = MonqueConfig::builder()
        .poll_interval(Duration::from_millis(20))
        .shutdown_timeout(Duration::from_secs(5))
        .build();
    let monque = instance(&store, config);
    let events = collect_events(&monque);

    monque
        .register("slow", |_job: Job| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(())
        })
        .unwrap();

    monque.start().await.unwrap();
    let job = monque.now("slow", json!({})).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || {
            store.job(job.id).map(|j| j.status) == Some(JobStatus::Processing)
        })
        .await
    );
    monque.stop().await.unwrap();

    // The handler was allowed to finish before stop() returned.
    assert_eq!(store.job(job.id).unwrap().status, JobStatus::Completed);

    // No new executions start after stop: a fresh job stays pending.
    settle().await;
    let started_before = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, JobEvent::Started { .. }))
        .count();
    let late = monque.now("slow", json!({})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.job(late.id).unwrap().status, JobStatus::Pending);
    let started_after = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, JobEvent::Started { .. }))
        .count();
    assert_eq!(started_before, started_after);
}

#[tokio::test]
async fn exhausted_drain_reports_the_incomplete_job() {
    let store = Arc::new(MemoryJobStore::new());
    let config = MonqueConfig::builder()
        .poll_interval(Duration::from_millis(20))
        .shutdown_timeout(Duration::from_millis(100))
        .build();
    let monque = instance(&store, config);
    let events = collect_events(&monque);

    monque
        .register("very-slow", |_job: Job| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .unwrap();

    monque.start().await.unwrap();
    let job = monque.now("very-slow", json!({})).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || {
            store.job(job.id).map(|j| j.status) == Some(JobStatus::Processing)
        })
        .await
    );

    let stopped_at = tokio::time::Instant::now();
    monque.stop().await.unwrap();
    assert!(stopped_at.elapsed() < Duration::from_secs(2));

    // The record is left processing, recoverable by lease expiry.
    assert_eq!(store.job(job.id).unwrap().status, JobStatus::Processing);

    settle().await;
    let events = events.lock().unwrap();
    let drained = events.iter().find_map(|e| match e {
        JobEvent::Errored {
            incomplete_jobs, ..
        } if !incomplete_jobs.is_empty() => Some(incomplete_jobs.clone()),
        _ => None,
    });
    assert_eq!(drained, Some(vec![job.id]));
}

#[tokio::test]
async fn change_notifications_dispatch_without_waiting_for_the_poll() {
    let store = Arc::new(MemoryJobStore::new());
    // Polling effectively disabled: only the startup poll and notifications.
    let config = MonqueConfig::builder()
        .poll_interval(Duration::from_secs(60))
        .build();
    let monque = instance(&store, config);

    monque.register("ping", |_job: Job| async move { Ok(()) }).unwrap();
    monque.start().await.unwrap();

    // Let the immediate startup poll pass first.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let job = monque.now("ping", json!({})).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || {
            store.job(job.id).map(|j| j.status) == Some(JobStatus::Completed)
        })
        .await,
        "notification-driven dispatch should not wait for the 60s poll"
    );
    monque.stop().await.unwrap();
}

#[tokio::test]
async fn instance_concurrency_caps_parallelism() {
    let store = Arc::new(MemoryJobStore::new());
    let config = MonqueConfig::builder()
        .poll_interval(Duration::from_millis(20))
        .instance_concurrency(1)
        .build();
    let monque = instance(&store, config);

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (current_h, peak_h) = (current.clone(), peak.clone());
    monque
        .register("burst", move |_job: Job| {
            let current = current_h.clone();
            let peak = peak_h.clone();
            async move {
                let running = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(running, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

    monque.start().await.unwrap();
    for _ in 0..4 {
        monque.now("burst", json!({})).await.unwrap();
    }

    assert!(
        wait_until(Duration::from_secs(5), || {
            store.jobs().iter().all(|j| j.status == JobStatus::Completed)
        })
        .await
    );
    monque.stop().await.unwrap();

    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn worker_concurrency_bounds_parallelism_per_name() {
    let store = Arc::new(MemoryJobStore::new());
    let monque = instance(&store, fast_config());

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (current_h, peak_h) = (current.clone(), peak.clone());
    monque
        .register_with(
            "burst",
            move |_job: Job| {
                let current = current_h.clone();
                let peak = peak_h.clone();
                async move {
                    let running = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(running, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            WorkerOptions::builder().concurrency(2).build(),
        )
        .unwrap();

    monque.start().await.unwrap();
    for _ in 0..6 {
        monque.now("burst", json!({})).await.unwrap();
    }

    assert!(
        wait_until(Duration::from_secs(5), || {
            store.jobs().iter().all(|j| j.status == JobStatus::Completed)
        })
        .await
    );
    monque.stop().await.unwrap();

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn panicking_handlers_are_contained_and_recorded() {
    let store = Arc::new(MemoryJobStore::new());
    let config = MonqueConfig::builder()
        .poll_interval(Duration::from_millis(20))
        .max_retries(1)
        .build();
    let monque = instance(&store, config);
    let events = collect_events(&monque);

    monque
        .register("explosive", |_job: Job| async move {
            panic!("handler blew up");
        })
        .unwrap();

    monque.start().await.unwrap();
    let job = monque.now("explosive", json!({})).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || {
            store.job(job.id).map(|j| j.status) == Some(JobStatus::Failed)
        })
        .await
    );
    monque.stop().await.unwrap();

    let failed = store.job(job.id).unwrap();
    assert!(failed.fail_reason.as_deref().unwrap().contains("panic"));

    settle().await;
    let events = events.lock().unwrap();
    assert!(events
        .iter()
        .any(|e| matches!(e, JobEvent::Errored { job_id: Some(id), .. } if *id == job.id)));
}

#[tokio::test]
async fn claim_errors_do_not_crash_the_dispatcher() {
    let store = Arc::new(MemoryJobStore::new());
    let monque = instance(&store, fast_config());
    let events = collect_events(&monque);

    monque.register("resilient", |_job: Job| async move { Ok(()) }).unwrap();
    monque.start().await.unwrap();

    store.induce_claim_errors(2);
    let job = monque.now("resilient", json!({})).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || {
            store.job(job.id).map(|j| j.status) == Some(JobStatus::Completed)
        })
        .await,
        "dispatcher should recover after transient claim failures"
    );
    monque.stop().await.unwrap();

    assert!(events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, JobEvent::Errored { .. })));
}
