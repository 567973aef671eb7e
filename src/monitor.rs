use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::error::Result;
use crate::project::ProjectStore;

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub interval: Duration,
    /// Put reclaimed projects back in the waiting queue instead of leaving
    /// them idle.
    pub requeue: bool,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_CHECK_INTERVAL,
            requeue: false,
        }
    }
}

/// Resets every stalled project once. Returns the ids actually reset; a
/// project whose reset fails is left for the next check.
pub async fn reclaim_stalled(store: &ProjectStore, requeue: bool) -> Result<Vec<String>> {
    let mut reclaimed = Vec::new();
    for project_id in store.get_stalled_projects().await? {
        warn!(message = "Stalled project, resetting", project_id = %project_id);
        if let Err(err) = store.reset_processing(&project_id).await {
            error!(message = "Failed to reset stalled project", project_id = %project_id, error = %err);
            continue;
        }
        if requeue {
            if let Err(err) = store.ask_processing(&project_id).await {
                warn!(message = "Failed to requeue stalled project", project_id = %project_id, error = %err);
            }
        }
        reclaimed.push(project_id);
    }
    Ok(reclaimed)
}

pub async fn run(cancel_token: CancellationToken, store: Arc<ProjectStore>, options: MonitorOptions) {
    let mut ticker = time::interval(options.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Monitor Cancelled");
                break;
            },
            _ = ticker.tick() => {
                match reclaim_stalled(&store, options.requeue).await {
                    Ok(stalled) if !stalled.is_empty() => {
                        info!(message = "Reclaimed stalled projects", count = stalled.len());
                    },
                    Ok(_) => {},
                    Err(err) => error!(message = "Stall check failed", error = %err),
                }
            },
        }
    }
    info!("Monitor stopped.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PROCESSING_SCHEMA;
    use crate::kv::{Batch, Command, FlakyStore, KvStore, MemoryStore};
    use crate::pipeline::validate_pipeline;
    use crate::project::{keys, ProjectStatus};
    use crate::storage::{ByteStream, FsStorage, Storage};
    use bytes::Bytes;
    use chrono::Utc;
    use futures::{stream, StreamExt};
    use serde_json::json;
    use tempfile::TempDir;

    const INPUT: &str = "adresse\n8 bd du port\n";

    async fn project_store(kv: Arc<dyn KvStore>) -> (ProjectStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::Fs(FsStorage::new(dir.path()).await.unwrap());
        (ProjectStore::new(kv, Arc::new(storage)), dir)
    }

    /// Claims a new project and backdates its heartbeat past the threshold.
    async fn stall(store: &ProjectStore, kv: &dyn KvStore) -> String {
        let id = store.create_project().await.unwrap().project.id;
        let pipeline = validate_pipeline(&json!({
            "format": "csv",
            "formatOptions": {},
            "geocodeOptions": {"q": "adresse"},
            "outputFormat": "geojson",
            "outputFormatOptions": {}
        }))
        .unwrap();
        store.set_pipeline(&id, &pipeline).await.unwrap();
        let body: ByteStream = stream::iter(vec![Ok(Bytes::from_static(INPUT.as_bytes()))]).boxed();
        store
            .set_input_file(&id, "input.csv", INPUT.len() as u64, body)
            .await
            .unwrap();
        store.ask_processing(&id).await.unwrap();
        store.process_next().await.unwrap();

        let old = Utc::now() - chrono::Duration::minutes(5);
        let fields = PROCESSING_SCHEMA.prepare(&[("heartbeat", old.into())]).unwrap();
        kv.exec(Batch::new().hset(keys::processing(&id), fields))
            .await
            .unwrap();
        id
    }

    async fn stalled_project() -> (ProjectStore, String, TempDir) {
        let kv = Arc::new(MemoryStore::new());
        let (store, dir) = project_store(kv.clone()).await;
        let id = stall(&store, kv.as_ref()).await;
        (store, id, dir)
    }

    #[tokio::test]
    async fn failed_reset_does_not_stop_the_others() {
        let kv = Arc::new(FlakyStore::new(|c| matches!(c, Command::LRem { .. }), 1));
        let (store, _dir) = project_store(kv.clone()).await;
        let first = stall(&store, kv.as_ref()).await;
        let second = stall(&store, kv.as_ref()).await;

        let reclaimed = reclaim_stalled(&store, false).await.unwrap();
        assert_eq!(reclaimed.len(), 1);

        let mut statuses = Vec::new();
        for id in [&first, &second] {
            statuses.push(store.get_project(id).await.unwrap().status);
        }
        statuses.sort_by_key(|s| s.as_str());
        assert_eq!(statuses, vec![ProjectStatus::Idle, ProjectStatus::Processing]);

        // the one left behind is picked up by the next check
        assert_eq!(reclaim_stalled(&store, false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stalled_project_is_reset_to_idle() {
        let (store, id, _dir) = stalled_project().await;

        assert_eq!(reclaim_stalled(&store, false).await.unwrap(), vec![id.clone()]);
        assert_eq!(store.get_project(&id).await.unwrap().status, ProjectStatus::Idle);
        assert!(reclaim_stalled(&store, false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stalled_project_can_be_requeued() {
        let (store, id, _dir) = stalled_project().await;

        reclaim_stalled(&store, true).await.unwrap();
        assert_eq!(store.get_project(&id).await.unwrap().status, ProjectStatus::Waiting);
        assert_eq!(store.process_next().await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let (store, id, _dir) = stalled_project().await;
        let cancel_token = CancellationToken::new();
        let options = MonitorOptions {
            interval: Duration::from_millis(10),
            requeue: false,
        };
        let store = Arc::new(store);
        let handle = tokio::spawn(run(cancel_token.clone(), Arc::clone(&store), options));

        time::sleep(Duration::from_millis(50)).await;
        cancel_token.cancel();
        handle.await.unwrap();
        assert_eq!(store.get_project(&id).await.unwrap().status, ProjectStatus::Idle);
    }
}
