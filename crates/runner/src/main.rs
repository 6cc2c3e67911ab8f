//! `renderq`: renders a small batch of rows through the queue with a
//! simulated worker and prints the final queue status as JSON.
//!
//! Configuration comes from `RENDERQ_*` environment variables, logging from
//! `RUST_LOG` and `RENDERQ_LOG_FORMAT`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use renderq_core::{JobId, ProjectId, TemplateId};
use renderq_queue::{FailureInfo, Job, NewJob, QueueConfig, RenderQueue};
use renderq_runner::{ProgressReporter, RenderDispatcher, RenderResult, RenderWorker};
use serde_json::json;

const DEMO_ROWS: u64 = 12;
const DEMO_DEADLINE: Duration = Duration::from_secs(30);

/// Sleeps instead of rendering. Every fourth row fails its first attempt.
struct SimulatedWorker {
    render_time: Duration,
}

#[async_trait::async_trait]
impl RenderWorker for SimulatedWorker {
    async fn render(&self, job: &Job, progress: ProgressReporter) -> RenderResult {
        tokio::time::sleep(self.render_time / 2).await;
        progress.report(50);

        let row = job.metadata.row_index.unwrap_or_default();
        if row % 4 == 3 && job.retry_count() == 0 {
            return Err(FailureInfo::new("render engine crashed")
                .with_details(format!("simulated crash on row {row}")));
        }

        tokio::time::sleep(self.render_time / 2).await;
        progress.report(100);
        Ok(job
            .metadata
            .output_filename
            .as_ref()
            .map(|name| format!("{}/{}", job.metadata.output_path.as_deref().unwrap_or("."), name)))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    renderq_observability::init();

    let config = QueueConfig::from_env().context("invalid RENDERQ_* configuration")?;
    tracing::info!(
        max_concurrent_renders = config.max_concurrent_renders,
        max_queue_size = config.max_queue_size,
        "starting render queue"
    );

    let queue = Arc::new(RenderQueue::new(config).context("invalid queue configuration")?);
    let tick = queue.start_safety_net();
    let worker = Arc::new(SimulatedWorker {
        render_time: Duration::from_millis(100),
    });
    let dispatcher = RenderDispatcher::spawn(Arc::clone(&queue), worker);

    let project = ProjectId::new("demo-campaign")?;
    let template = TemplateId::new("lower-third")?;
    for row in 0..DEMO_ROWS {
        let name = format!("row-{row:03}.mp4");
        let payload = json!({ "template": template.as_str(), "row": row });
        let job = NewJob::new(JobId::generate(), payload)
            .for_project(project.clone())
            .with_template(template.clone())
            .with_row(row, json!({ "title": format!("Title {row}") }))
            .with_output("renders/demo-campaign", name)
            // Every fifth row is a rush order.
            .with_priority(if row % 5 == 0 { 10 } else { 0 });
        queue
            .admit(job)
            .with_context(|| format!("failed to admit row {row}"))?;
    }

    let started = tokio::time::Instant::now();
    loop {
        let summary = queue.project_summary(&project);
        if summary.is_finished() {
            tracing::info!(
                completed = summary.completed,
                failed = summary.failed,
                "project finished"
            );
            break;
        }
        if started.elapsed() > DEMO_DEADLINE {
            bail!(
                "project did not finish within {:?}: {} pending, {} processing",
                DEMO_DEADLINE,
                summary.pending,
                summary.processing
            );
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    for job in dispatcher.shutdown().await {
        queue.fail(&job.id, FailureInfo::new("runner shutting down"))?;
    }
    tick.join().await;

    println!("{}", serde_json::to_string_pretty(&queue.status())?);
    Ok(())
}
