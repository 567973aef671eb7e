use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::job::JobContext;
use crate::project::ProjectStore;
use crate::worker::{self, Assignment, WorkMessage};

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub concurrency: usize,
    pub tick_interval: Duration,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get(),
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

/// Outcomes forwarded to an optional observer of the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkResponseMessage {
    JobCompleted(String),
    JobFailed(String, String),
    QueueError(String),
}

/// Claims waiting projects while free slots remain. Stops early once the
/// queue is empty.
async fn fill_slots(
    store: &ProjectStore,
    slots: &Arc<Semaphore>,
    send_to_queue: &async_channel::Sender<Assignment>,
) -> Result<usize, Error> {
    let mut claimed = 0;
    while let Ok(permit) = Arc::clone(slots).try_acquire_owned() {
        let Some(project_id) = store.process_next().await? else {
            break;
        };
        debug!(message = "Claimed project", project_id = %project_id);
        send_to_queue
            .send(Assignment { project_id, permit })
            .await?;
        claimed += 1;
    }
    Ok(claimed)
}

fn notify(send_to_client: &Option<mpsc::UnboundedSender<WorkResponseMessage>>, msg: WorkResponseMessage) {
    if let Some(client) = send_to_client {
        if client.send(msg).is_err() {
            trace!("Client channel closed");
        }
    }
}

fn forward(
    send_to_client: &Option<mpsc::UnboundedSender<WorkResponseMessage>>,
    msg: WorkMessage,
) {
    match msg {
        WorkMessage::JobStarted(project_id) => {
            debug!(message = "Starting job", project_id = %project_id);
        }
        WorkMessage::JobCompleted(project_id) => {
            debug!(message = "Completed job", project_id = %project_id);
            notify(send_to_client, WorkResponseMessage::JobCompleted(project_id));
        }
        WorkMessage::JobFailed(project_id, error_msg) => {
            debug!(message = "Failed job", project_id = %project_id, error = %error_msg);
            notify(send_to_client, WorkResponseMessage::JobFailed(project_id, error_msg));
        }
    }
}

/// Runs the worker pool until `cancel_token` fires. On cancellation no new
/// project is claimed; in-flight jobs run to completion before this returns.
pub async fn serve(
    cancel_token: CancellationToken,
    ctx: Arc<JobContext>,
    options: ServeOptions,
    send_to_client: Option<mpsc::UnboundedSender<WorkResponseMessage>>,
) -> Result<(), Error> {
    let concurrency = options.concurrency.max(1);
    info!(concurrency, "Starting worker pool");

    let slots = Arc::new(Semaphore::new(concurrency));
    let (send_to_server, mut recv_from_worker) = mpsc::unbounded_channel::<WorkMessage>();
    let (send_to_queue, recv_from_queue) = async_channel::bounded::<Assignment>(concurrency);

    let mut workers = vec![];
    for worker_id in 0..concurrency {
        let ctx = Arc::clone(&ctx);
        let recv_from_queue = recv_from_queue.clone();
        let send_to_server = send_to_server.clone();
        let join_handle = tokio::spawn(
            worker::start(ctx, recv_from_queue, send_to_server)
                .instrument(info_span!("worker", worker_id)),
        );
        workers.push(join_handle);
    }
    drop(recv_from_queue);
    drop(send_to_server);

    let mut ticker = time::interval(options.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Server Cancelled");
                break;
            },
            _ = ticker.tick() => {
                if let Err(err) = fill_slots(&ctx.store, &slots, &send_to_queue).await {
                    error!(message = "Failed to claim projects", error = %err);
                    notify(&send_to_client, WorkResponseMessage::QueueError(format!("{err:#}")));
                }
            },
            chan_msg = recv_from_worker.recv() => {
                match chan_msg {
                    None => {
                        debug!("Worker channel closed unexpectedly, exiting");
                        break;
                    },
                    Some(msg) => {
                        let finished = !matches!(msg, WorkMessage::JobStarted(_));
                        forward(&send_to_client, msg);
                        // a freed slot is refilled without waiting for the next tick
                        if finished && !cancel_token.is_cancelled() {
                            if let Err(err) = fill_slots(&ctx.store, &slots, &send_to_queue).await {
                                error!(message = "Failed to claim projects", error = %err);
                                notify(&send_to_client, WorkResponseMessage::QueueError(format!("{err:#}")));
                            }
                        }
                    },
                }
            }
        }
    }

    // Workers drain what was already claimed, then stop
    send_to_queue.close();
    let results = futures::future::join_all(workers).await;
    while let Ok(msg) = recv_from_worker.try_recv() {
        forward(&send_to_client, msg);
    }
    results.into_iter().collect::<Result<Vec<_>, _>>()?;

    info!("Server stopped.");

    Ok(())
}
