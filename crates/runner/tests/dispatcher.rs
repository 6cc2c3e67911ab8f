use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use renderq_core::JobId;
use renderq_queue::{
    FailureInfo, Job, JobEvent, JobEventKind, JobStatus, NewJob, QueueConfig, RenderQueue,
};
use renderq_runner::{ProgressReporter, RenderDispatcher, RenderResult, RenderWorker};
use serde_json::json;

/// Records how many renders overlap; fails or panics on request.
#[derive(Default)]
struct MockWorker {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    attempts: AtomicUsize,
    fail_always: bool,
    panic_on: Option<&'static str>,
}

#[async_trait::async_trait]
impl RenderWorker for MockWorker {
    async fn render(&self, job: &Job, progress: ProgressReporter) -> RenderResult {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(10)).await;
        progress.report(60);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.panic_on == Some(job.id.as_str()) {
            panic!("encoder segfault");
        }
        if self.fail_always {
            return Err(FailureInfo::new("license server unreachable"));
        }
        Ok(Some(format!("/out/{}.mp4", job.id)))
    }
}

fn id(s: &str) -> JobId {
    JobId::new(s).unwrap()
}

fn job(name: &str) -> NewJob {
    NewJob::new(id(name), json!({ "template": "promo" }))
}

async fn wait_until_idle(queue: &RenderQueue) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !queue.status().is_idle() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("queue should drain");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn renders_every_job_within_concurrency_limit() {
    let queue = Arc::new(RenderQueue::new(
        QueueConfig::default().with_max_concurrent_renders(2),
    )
    .unwrap());
    let worker = Arc::new(MockWorker::default());
    let dispatcher = RenderDispatcher::spawn(Arc::clone(&queue), Arc::clone(&worker));

    for n in 0..10 {
        queue.admit(job(&format!("clip-{n}"))).unwrap();
    }
    wait_until_idle(&queue).await;
    dispatcher.shutdown().await;

    let status = queue.status();
    assert_eq!(status.completed, 10);
    assert_eq!(worker.attempts.load(Ordering::SeqCst), 10);
    assert!(worker.peak.load(Ordering::SeqCst) <= 2);

    let done = queue.job(&id("clip-3")).unwrap();
    assert_eq!(done.metadata.result.as_deref(), Some("/out/clip-3.mp4"));
    assert_eq!(done.metadata.progress, 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_worker_exhausts_retries() {
    let queue = Arc::new(RenderQueue::new(QueueConfig::default().with_retries(true, 2)).unwrap());
    let events = queue.subscribe_to(&[JobEventKind::JobRetry, JobEventKind::JobFailed]);
    let worker = Arc::new(MockWorker {
        fail_always: true,
        ..Default::default()
    });
    let dispatcher = RenderDispatcher::spawn(Arc::clone(&queue), Arc::clone(&worker));

    queue.admit(job("doomed")).unwrap();
    wait_until_idle(&queue).await;
    dispatcher.shutdown().await;

    let failed = queue.job(&id("doomed")).unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.metadata.retry_count, 2);
    assert_eq!(worker.attempts.load(Ordering::SeqCst), 3);

    let kinds: Vec<_> = events.drain().iter().map(JobEvent::kind).collect();
    assert_eq!(
        kinds,
        vec![
            JobEventKind::JobRetry,
            JobEventKind::JobRetry,
            JobEventKind::JobFailed
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_render_is_reported_as_failure() {
    let queue = Arc::new(RenderQueue::new(QueueConfig::default().with_retries(false, 0)).unwrap());
    let worker = Arc::new(MockWorker {
        panic_on: Some("cursed"),
        ..Default::default()
    });
    let dispatcher = RenderDispatcher::spawn(Arc::clone(&queue), worker);

    queue.admit(job("cursed")).unwrap();
    queue.admit(job("fine")).unwrap();
    wait_until_idle(&queue).await;
    dispatcher.shutdown().await;

    let cursed = queue.job(&id("cursed")).unwrap();
    assert_eq!(cursed.status, JobStatus::Failed);
    assert_eq!(cursed.metadata.error.as_deref(), Some("render task panicked"));
    assert_eq!(queue.job(&id("fine")).unwrap().status, JobStatus::Completed);
    assert_eq!(queue.active_workers(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn progress_reports_are_published() {
    let queue = Arc::new(RenderQueue::default());
    let progress = queue.subscribe_to(&[JobEventKind::JobProgress]);
    let dispatcher = RenderDispatcher::spawn(Arc::clone(&queue), Arc::new(MockWorker::default()));

    queue.admit(job("tracked")).unwrap();
    wait_until_idle(&queue).await;
    dispatcher.shutdown().await;

    let reported: Vec<u8> = progress
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            JobEvent::JobProgress { progress, .. } => Some(progress),
            _ => None,
        })
        .collect();
    assert_eq!(reported, vec![60]);
}

#[tokio::test]
async fn shutdown_without_work_returns_promptly() {
    let queue = Arc::new(RenderQueue::default());
    let dispatcher = RenderDispatcher::spawn(queue, Arc::new(MockWorker::default()));

    tokio::time::timeout(Duration::from_secs(2), dispatcher.shutdown())
        .await
        .expect("dispatcher should stop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_accounts_for_every_handoff() {
    let queue = Arc::new(RenderQueue::new(
        QueueConfig::default().with_max_concurrent_renders(8),
    )
    .unwrap());
    let dispatcher = RenderDispatcher::spawn(Arc::clone(&queue), Arc::new(MockWorker::default()));

    for n in 0..16 {
        queue.admit(job(&format!("late-{n}"))).unwrap();
    }
    let unrendered = dispatcher.shutdown().await;

    // Every processing job is either rendered or returned to the caller.
    let returned: Vec<JobId> = unrendered.iter().map(|job| job.id.clone()).collect();
    for n in 0..16 {
        let job = queue.job(&id(&format!("late-{n}"))).unwrap();
        match job.status {
            JobStatus::Processing => assert!(returned.contains(&job.id), "{} stranded", job.id),
            JobStatus::Pending | JobStatus::Completed => assert!(!returned.contains(&job.id)),
            other => panic!("unexpected status {other:?}"),
        }
    }
    for job in unrendered {
        queue.fail(&job.id, "dispatcher stopped").unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopped_dispatcher_no_longer_receives_handoffs() {
    let queue = Arc::new(RenderQueue::default());
    let worker = Arc::new(MockWorker::default());
    let dispatcher = RenderDispatcher::spawn(Arc::clone(&queue), Arc::clone(&worker));
    assert!(dispatcher.shutdown().await.is_empty());

    queue.admit(job("orphan")).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(worker.attempts.load(Ordering::SeqCst), 0);
    assert_eq!(queue.job(&id("orphan")).unwrap().status, JobStatus::Processing);
}
