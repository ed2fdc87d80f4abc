//! Behaviour every [`JobStore`] must share. Each backend's test module calls
//! [`run_all`] with a factory that builds a fresh, empty store.

use chrono::{TimeDelta, Utc};
use jobq_core::{
    EnqueueRequest, JobId, JobState, NewJob, NewJobRun, QueueConfig, RetryPolicy, Transition,
};

use crate::clock::{Clock, ManualClock};
use crate::error::JobStoreError;
use crate::store::JobStore;

type Case<S> = fn(&S, &ManualClock);

pub(crate) fn run_all<S, G, F>(make: F)
where
    S: JobStore,
    F: Fn(Clock) -> (S, G),
{
    let cases: &[(&str, Case<S>)] = &[
        ("enqueue_applies_defaults", enqueue_applies_defaults::<S>),
        ("duplicate_ids_are_rejected", duplicate_ids_are_rejected::<S>),
        ("claim_follows_priority_then_fifo", claim_follows_priority_then_fifo::<S>),
        ("scheduled_jobs_wait_for_run_at", scheduled_jobs_wait_for_run_at::<S>),
        ("claim_requires_worker_id", claim_requires_worker_id::<S>),
        ("failures_back_off_exponentially", failures_back_off_exponentially::<S>),
        ("exhausted_retries_dead_letter", exhausted_retries_dead_letter::<S>),
        ("dead_letter_retry_resets_job", dead_letter_retry_resets_job::<S>),
        ("invalid_transitions_are_refused", invalid_transitions_are_refused::<S>),
        ("sweep_moves_only_due_failures", sweep_moves_only_due_failures::<S>),
        ("stats_and_runs_reflect_history", stats_and_runs_reflect_history::<S>),
        ("list_filters_by_state", list_filters_by_state::<S>),
    ];
    for (name, case) in cases {
        let manual = ManualClock::new(Utc::now());
        let (store, _guard) = make(manual.clock());
        eprintln!("contract case: {name}");
        case(&store, &manual);
    }
}

fn id(raw: &str) -> JobId {
    JobId::new(raw).unwrap()
}

fn job(raw: &str) -> NewJob {
    EnqueueRequest::new(raw, "true")
        .validate(&QueueConfig::default())
        .unwrap()
}

/// Claim `raw` and fail it once, returning the resulting attempt count.
fn claim_and_fail<S: JobStore>(store: &S, raw: &str, policy: &RetryPolicy) -> u32 {
    let claimed = store.claim_next("w1").unwrap().unwrap();
    assert_eq!(claimed.id.as_str(), raw);
    let counts = store.increment_attempts(&claimed.id).unwrap();
    store
        .reschedule_or_dead(
            &claimed.id,
            "exit:1",
            counts.attempts,
            counts.max_retries,
            policy,
        )
        .unwrap();
    counts.attempts
}

fn enqueue_applies_defaults<S: JobStore>(store: &S, clock: &ManualClock) {
    let stored = store.enqueue(job("a")).unwrap();
    assert_eq!(stored.state, JobState::Pending);
    assert_eq!(stored.attempts, 0);
    assert_eq!(stored.max_retries, 3);
    assert_eq!(stored.priority, 100);
    assert_eq!(stored.next_run_at, Some(clock.now()));
    assert_eq!(stored.worker, None);
    assert_eq!(store.get(&id("a")).unwrap(), Some(stored));
    assert_eq!(store.get(&id("missing")).unwrap(), None);
}

fn duplicate_ids_are_rejected<S: JobStore>(store: &S, _clock: &ManualClock) {
    store.enqueue(job("dup")).unwrap();
    let err = store.enqueue(job("dup")).unwrap_err();
    assert!(matches!(err, JobStoreError::AlreadyExists(ref d) if d.as_str() == "dup"));
    assert_eq!(store.stats().unwrap().total_jobs, 1);
}

fn claim_follows_priority_then_fifo<S: JobStore>(store: &S, clock: &ManualClock) {
    let prioritized = |raw: &str, priority: i64| {
        let mut new = job(raw);
        new.priority = priority;
        new
    };
    store.enqueue(prioritized("c", 1)).unwrap();
    clock.advance(TimeDelta::milliseconds(5));
    store.enqueue(prioritized("a", 1)).unwrap();
    store.enqueue(prioritized("b", 5)).unwrap();

    let order: Vec<String> = std::iter::from_fn(|| store.claim_next("w1").unwrap())
        .map(|j| j.id.as_str().to_owned())
        .collect();
    assert_eq!(order, ["c", "a", "b"]);

    let held = store.get(&id("a")).unwrap().unwrap();
    assert_eq!(held.state, JobState::Processing);
    assert_eq!(held.worker.as_deref(), Some("w1"));
}

fn scheduled_jobs_wait_for_run_at<S: JobStore>(store: &S, clock: &ManualClock) {
    let mut later = job("later");
    later.run_at = Some(clock.now() + TimeDelta::seconds(30));
    store.enqueue(later).unwrap();

    assert!(store.claim_next("w1").unwrap().is_none());
    clock.advance(TimeDelta::seconds(29));
    assert!(store.claim_next("w1").unwrap().is_none());
    clock.advance(TimeDelta::seconds(1));
    let claimed = store.claim_next("w1").unwrap().unwrap();
    assert_eq!(claimed.id.as_str(), "later");
}

fn claim_requires_worker_id<S: JobStore>(store: &S, _clock: &ManualClock) {
    store.enqueue(job("a")).unwrap();
    assert!(matches!(
        store.claim_next("  "),
        Err(JobStoreError::Domain(_))
    ));
    assert_eq!(store.get(&id("a")).unwrap().unwrap().state, JobState::Pending);
}

fn failures_back_off_exponentially<S: JobStore>(store: &S, clock: &ManualClock) {
    let policy = RetryPolicy::exponential(2);
    let mut flaky = job("flaky");
    flaky.max_retries = 5;
    store.enqueue(flaky).unwrap();

    for (attempt, delay) in [(1, 2), (2, 4), (3, 8)] {
        let failed_at = clock.now();
        assert_eq!(claim_and_fail(store, "flaky", &policy), attempt);

        let parked = store.get(&id("flaky")).unwrap().unwrap();
        assert_eq!(parked.state, JobState::Failed);
        assert_eq!(parked.worker, None);
        assert_eq!(parked.last_error.as_deref(), Some("exit:1"));
        assert_eq!(
            parked.next_run_at,
            Some(failed_at + TimeDelta::seconds(delay))
        );

        clock.advance(TimeDelta::seconds(delay - 1));
        assert!(store.claim_next("w1").unwrap().is_none());
        clock.advance(TimeDelta::seconds(1));
    }
    assert_eq!(claim_and_fail(store, "flaky", &policy), 4);
}

fn exhausted_retries_dead_letter<S: JobStore>(store: &S, clock: &ManualClock) {
    let policy = RetryPolicy::exponential(2);
    let mut doomed = job("doomed");
    doomed.max_retries = 2;
    store.enqueue(doomed).unwrap();

    claim_and_fail(store, "doomed", &policy);
    clock.advance(TimeDelta::seconds(2));
    claim_and_fail(store, "doomed", &policy);

    let dead = store.get(&id("doomed")).unwrap().unwrap();
    assert_eq!(dead.state, JobState::Dead);
    assert_eq!(dead.attempts, 2);
    assert_eq!(dead.worker, None);
    assert_eq!(dead.last_error.as_deref(), Some("exit:1"));

    clock.advance(TimeDelta::hours(1));
    assert!(store.claim_next("w1").unwrap().is_none());
    assert_eq!(store.sweep_due_retries().unwrap(), 0);
}

fn dead_letter_retry_resets_job<S: JobStore>(store: &S, clock: &ManualClock) {
    let mut once = job("once");
    once.max_retries = 1;
    store.enqueue(once).unwrap();
    claim_and_fail(store, "once", &RetryPolicy::default());
    assert_eq!(
        store.get(&id("once")).unwrap().unwrap().state,
        JobState::Dead
    );

    clock.advance(TimeDelta::seconds(5));
    let revived = store.retry_from_dead_letter(&id("once")).unwrap();
    assert_eq!(revived.state, JobState::Pending);
    assert_eq!(revived.attempts, 0);
    assert_eq!(revived.last_error, None);
    assert_eq!(revived.next_run_at, Some(clock.now()));

    let claimed = store.claim_next("w2").unwrap().unwrap();
    assert_eq!(claimed.id.as_str(), "once");
    store.complete(&claimed.id).unwrap();
    assert_eq!(
        store.get(&id("once")).unwrap().unwrap().state,
        JobState::Completed
    );
}

fn invalid_transitions_are_refused<S: JobStore>(store: &S, _clock: &ManualClock) {
    store.enqueue(job("idle")).unwrap();

    match store.complete(&id("idle")) {
        Err(JobStoreError::InvalidTransition {
            transition, from, ..
        }) => {
            assert_eq!(transition, Transition::Complete);
            assert_eq!(from, JobState::Pending);
        }
        other => panic!("expected invalid transition, got {other:?}"),
    }
    assert!(matches!(
        store.retry_from_dead_letter(&id("idle")),
        Err(JobStoreError::InvalidTransition {
            transition: Transition::Revive,
            from: JobState::Pending,
            ..
        })
    ));
    assert!(matches!(
        store.increment_attempts(&id("idle")),
        Err(JobStoreError::InvalidTransition { .. })
    ));
    assert!(matches!(
        store.complete(&id("ghost")),
        Err(JobStoreError::NotFound(_))
    ));
    assert!(matches!(
        store.retry_from_dead_letter(&id("ghost")),
        Err(JobStoreError::NotFound(_))
    ));

    let claimed = store.claim_next("w1").unwrap().unwrap();
    store.complete(&claimed.id).unwrap();
    assert!(matches!(
        store.complete(&claimed.id),
        Err(JobStoreError::InvalidTransition {
            from: JobState::Completed,
            ..
        })
    ));
    let untouched = store.get(&claimed.id).unwrap().unwrap();
    assert_eq!(untouched.state, JobState::Completed);
}

fn sweep_moves_only_due_failures<S: JobStore>(store: &S, clock: &ManualClock) {
    let policy = RetryPolicy::exponential(10);
    store.enqueue(job("slow")).unwrap();
    claim_and_fail(store, "slow", &policy);
    store.enqueue(job("quick")).unwrap();
    claim_and_fail(store, "quick", &RetryPolicy::exponential(2));

    clock.advance(TimeDelta::seconds(2));
    assert_eq!(store.sweep_due_retries().unwrap(), 1);
    assert_eq!(
        store.get(&id("quick")).unwrap().unwrap().state,
        JobState::Pending
    );
    assert_eq!(
        store.get(&id("slow")).unwrap().unwrap().state,
        JobState::Failed
    );

    clock.advance(TimeDelta::seconds(8));
    assert_eq!(store.sweep_due_retries().unwrap(), 1);
    assert_eq!(store.sweep_due_retries().unwrap(), 0);
}

fn stats_and_runs_reflect_history<S: JobStore>(store: &S, clock: &ManualClock) {
    for raw in ["r1", "r2", "r3"] {
        store.enqueue(job(raw)).unwrap();
    }
    let first = store.claim_next("w1").unwrap().unwrap();
    store.claim_next("w1").unwrap().unwrap();

    for (n, exit) in [0, 1, 0].into_iter().enumerate() {
        let started_at = clock.now();
        clock.advance(TimeDelta::milliseconds(250));
        let run = store
            .record_run(NewJobRun {
                job_id: first.id.clone(),
                started_at,
                finished_at: clock.now(),
                exit_code: Some(exit),
                bytes_stdout: n as u64 * 10,
                bytes_stderr: 0,
            })
            .unwrap();
        assert_eq!(run.duration_ms, 250);
    }
    store.complete(&first.id).unwrap();

    let recent = store.recent_runs(2).unwrap();
    assert_eq!(recent.len(), 2);
    assert!(recent[0].id > recent[1].id);
    assert_eq!(recent[0].bytes_stdout, 20);
    assert_eq!(recent[1].exit_code, Some(1));
    assert_eq!(store.recent_runs(10).unwrap().len(), 3);

    let stats = store.stats().unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.processing, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.dead, 0);
    assert_eq!(stats.total_jobs, 3);
    assert_eq!(stats.total_runs, 3);
}

fn list_filters_by_state<S: JobStore>(store: &S, _clock: &ManualClock) {
    for raw in ["x", "y", "z"] {
        store.enqueue(job(raw)).unwrap();
    }
    store.claim_next("w1").unwrap().unwrap();

    let all: Vec<String> = store
        .list(None)
        .unwrap()
        .into_iter()
        .map(|j| j.id.as_str().to_owned())
        .collect();
    assert_eq!(all, ["x", "y", "z"]);

    let pending = store.list(Some(JobState::Pending)).unwrap();
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|j| j.state == JobState::Pending));
    assert!(store.list(Some(JobState::Dead)).unwrap().is_empty());
}
