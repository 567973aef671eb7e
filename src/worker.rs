use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_channel::Receiver;
use futures::FutureExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::OwnedSemaphorePermit;
use tracing::*;

use crate::job::{self, JobContext};

/// A claimed project together with the pool slot it occupies.
#[derive(Debug)]
pub struct Assignment {
    pub project_id: String,
    pub permit: OwnedSemaphorePermit,
}

#[derive(Debug)]
pub enum WorkMessage {
    JobStarted(String),
    JobCompleted(String),
    JobFailed(String, String),
}

/// Runs assignments until the queue is closed and drained.
pub async fn start(
    ctx: Arc<JobContext>,
    recv_from_queue: Receiver<Assignment>,
    send_to_server: UnboundedSender<WorkMessage>,
) {
    while let Ok(Assignment { project_id, permit }) = recv_from_queue.recv().await {
        // a closed server channel only means nobody listens for outcomes
        let _ = send_to_server.send(WorkMessage::JobStarted(project_id.clone()));

        let message = match execute(&ctx, &project_id).await {
            None => WorkMessage::JobCompleted(project_id),
            Some(error_msg) => WorkMessage::JobFailed(project_id, error_msg),
        };
        drop(permit);

        if send_to_server.send(message).is_err() {
            debug!("Server channel closed, outcome not reported");
        }
    }
    info!("Worker stopped.");
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_string());
    format!("Job panicked: {detail}")
}

/// Runs the job and always ends processing. Returns the recorded error, if any.
async fn execute(ctx: &JobContext, project_id: &str) -> Option<String> {
    let outcome = AssertUnwindSafe(job::run(ctx, project_id))
        .catch_unwind()
        .await;
    let error = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(format!("{err:#}")),
        Err(panic) => Some(panic_message(panic)),
    };

    if let Some(error_msg) = &error {
        error!(message = "Error during processing", project_id, error = %error_msg);
    }

    if let Err(err) = ctx.store.end_processing(project_id, error.as_deref()).await {
        error!(message = "Failed to end processing", project_id, error = %err);
        return Some(error.unwrap_or_else(|| err.to_string()));
    }
    error
}
