//! Project store: the lifecycle state machine and the job queue.
//!
//! ```text
//! idle -> waiting -> processing -> completed | failed
//!   ^________________ resetProcessing ______________|
//! ```
//!
//! Every operation checks the current status before mutating and fails with
//! [`Error::Conflict`] otherwise. Multi-key mutations go through one
//! [`Batch`], so a project is never observed half-moved between the waiting
//! queue and the processing set.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::codec::{FieldValue, Record, META_SCHEMA, PROCESSING_SCHEMA};
use crate::error::{Error, Result};
use crate::kv::{Batch, KvStore};
use crate::pipeline::csv::ValidationProgress;
use crate::pipeline::geocode::GeocodingProgress;
use crate::pipeline::Pipeline;
use crate::storage::{ByteStream, ObjectStorage, ObjectType, Storage};

/// Lifetime of the enqueue guard taken by `ask_processing`.
pub const ASK_GUARD_TTL: Duration = Duration::from_secs(60);

/// A processing project whose heartbeat is older than this is stalled.
pub const STALL_THRESHOLD: Duration = Duration::from_secs(2 * 60);

pub const DEFAULT_MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

const ID_LENGTH: usize = 10;
const TOKEN_LENGTH: usize = 24;

pub(crate) mod keys {
    pub const WAITING_QUEUE: &str = "waiting-queue";
    pub const PROCESSING_SET: &str = "processing-list";

    pub fn meta(id: &str) -> String {
        format!("project:{id}:meta")
    }

    pub fn processing(id: &str) -> String {
        format!("project:{id}:processing")
    }

    pub fn token(token: &str) -> String {
        format!("token:{token}")
    }

    pub fn input_obj_key(id: &str) -> String {
        format!("project:{id}:input-obj-key")
    }

    pub fn output_obj_key(id: &str) -> String {
        format!("project:{id}:output-obj-key")
    }

    pub fn processing_asked(id: &str) -> String {
        format!("project:{id}:processing-asked")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Idle,
    Waiting,
    Processing,
    Completed,
    Failed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Waiting => "waiting",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "idle" => Self::Idle,
            "waiting" => Self::Waiting,
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            other => return Err(Error::Serialization(format!("unknown project status {other}"))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStep {
    Starting,
    Validating,
    Geocoding,
    Completed,
    Failed,
}

impl ProcessingStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Validating => "validating",
            Self::Geocoding => "geocoding",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for ProcessingStep {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "starting" => Self::Starting,
            "validating" => Self::Validating,
            "geocoding" => Self::Geocoding,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            other => return Err(Error::Serialization(format!("unknown processing step {other}"))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserParams {
    pub max_file_size: u64,
}

impl Default for UserParams {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub filename: String,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Processing {
    pub step: Option<ProcessingStep>,
    pub validation_progress: Option<ValidationProgress>,
    pub geocoding_progress: Option<GeocodingProgress>,
    pub validation_error: Option<String>,
    pub geocoding_error: Option<String>,
    pub global_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub heartbeat: Option<DateTime<Utc>>,
}

impl Processing {
    fn hydrate(record: &Record) -> Result<Self> {
        Ok(Self {
            step: record.string("step").map(|s| s.parse()).transpose()?,
            validation_progress: record.json("validationProgress")?,
            geocoding_progress: record.json("geocodingProgress")?,
            validation_error: record.string("validationError"),
            geocoding_error: record.string("geocodingError"),
            global_error: record.string("globalError"),
            started_at: record.date("startedAt"),
            finished_at: record.date("finishedAt"),
            heartbeat: record.date("heartbeat"),
        })
    }
}

/// Fields merged into the processing substate by `update_processing`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessingUpdate {
    pub step: Option<ProcessingStep>,
    pub validation_progress: Option<ValidationProgress>,
    pub geocoding_progress: Option<GeocodingProgress>,
    pub validation_error: Option<String>,
    pub geocoding_error: Option<String>,
}

impl ProcessingUpdate {
    fn values(&self) -> Result<Vec<(&'static str, FieldValue)>> {
        let mut values = Vec::new();
        if let Some(step) = self.step {
            values.push(("step", step.as_str().into()));
        }
        if let Some(progress) = &self.validation_progress {
            values.push(("validationProgress", FieldValue::json(progress)?));
        }
        if let Some(progress) = &self.geocoding_progress {
            values.push(("geocodingProgress", FieldValue::json(progress)?));
        }
        if let Some(message) = &self.validation_error {
            values.push(("validationError", message.as_str().into()));
        }
        if let Some(message) = &self.geocoding_error {
            values.push(("geocodingError", message.as_str().into()));
        }
        Ok(values)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Project {
    pub id: String,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub user_params: UserParams,
    pub pipeline: Option<Pipeline>,
    pub input_file: Option<FileInfo>,
    pub output_file: Option<FileInfo>,
    pub processing: Processing,
}

impl Project {
    fn hydrate(id: &str, meta: &Record, processing: &Record) -> Result<Self> {
        let missing = |field: &str| Error::Serialization(format!("project {id} has no {field}"));
        Ok(Self {
            id: id.to_string(),
            status: status_of(meta)?.ok_or_else(|| missing("status"))?,
            created_at: meta.date("createdAt").ok_or_else(|| missing("createdAt"))?,
            updated_at: meta.date("updatedAt").ok_or_else(|| missing("updatedAt"))?,
            user_params: meta.json("userParams")?.unwrap_or_default(),
            pipeline: meta.json("pipeline")?,
            input_file: meta.json("inputFile")?,
            output_file: meta.json("outputFile")?,
            processing: Processing::hydrate(processing)?,
        })
    }
}

/// Returned once by `create_project`; the token is never readable afterwards.
#[derive(Debug, Clone)]
pub struct CreatedProject {
    pub project: Project,
    pub token: String,
}

fn random_id(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn status_of(meta: &Record) -> Result<Option<ProjectStatus>> {
    meta.string("status").map(|s| s.parse()).transpose()
}

fn meta_status(status: ProjectStatus, now: DateTime<Utc>) -> Result<Vec<(String, String)>> {
    META_SCHEMA.prepare(&[("status", status.as_str().into()), ("updatedAt", now.into())])
}

pub struct ProjectStore {
    kv: Arc<dyn KvStore>,
    storage: Arc<Storage>,
}

impl ProjectStore {
    pub fn new(kv: Arc<dyn KvStore>, storage: Arc<Storage>) -> Self {
        Self { kv, storage }
    }

    async fn meta(&self, id: &str) -> Result<Record> {
        META_SCHEMA.hydrate(self.kv.hgetall(&keys::meta(id)).await?)
    }

    async fn status(&self, id: &str) -> Result<Option<ProjectStatus>> {
        self.kv
            .hget(&keys::meta(id), "status")
            .await?
            .map(|s| s.parse())
            .transpose()
    }

    pub async fn ensure_status(&self, id: &str, expected: ProjectStatus) -> Result<()> {
        let actual = self.status(id).await?;
        if actual != Some(expected) {
            return Err(Error::conflict(id, expected, actual));
        }
        Ok(())
    }

    pub async fn create_project(&self) -> Result<CreatedProject> {
        let id = random_id(ID_LENGTH);
        let token = random_id(TOKEN_LENGTH);
        let now = Utc::now();
        let user_params = UserParams::default();

        let fields = META_SCHEMA.prepare(&[
            ("id", id.as_str().into()),
            ("status", ProjectStatus::Idle.as_str().into()),
            ("createdAt", now.into()),
            ("updatedAt", now.into()),
            ("userParams", FieldValue::json(&user_params)?),
        ])?;
        self.kv
            .exec(
                Batch::new()
                    .hset(keys::meta(&id), fields)
                    .set(keys::token(&token), id.as_str()),
            )
            .await?;
        debug!(project_id = %id, "Created project");

        Ok(CreatedProject {
            project: Project {
                id,
                status: ProjectStatus::Idle,
                created_at: now,
                updated_at: now,
                user_params,
                pipeline: None,
                input_file: None,
                output_file: None,
                processing: Processing::default(),
            },
            token,
        })
    }

    pub async fn get_project(&self, id: &str) -> Result<Project> {
        let meta = self.meta(id).await?;
        if meta.string("id").is_none() {
            return Err(Error::NotFound(format!("project {id}")));
        }
        let processing = PROCESSING_SCHEMA.hydrate(self.kv.hgetall(&keys::processing(id)).await?)?;
        Project::hydrate(id, &meta, &processing)
    }

    pub async fn check_project_token(&self, id: &str, token: &str) -> Result<bool> {
        if id.is_empty() || token.is_empty() {
            return Ok(false);
        }
        Ok(self.kv.get(&keys::token(token)).await?.as_deref() == Some(id))
    }

    pub async fn authorize(&self, id: &str, token: &str) -> Result<()> {
        if self.check_project_token(id, token).await? {
            Ok(())
        } else {
            Err(Error::Auth)
        }
    }

    pub async fn touch_project(&self, id: &str) -> Result<()> {
        let fields = META_SCHEMA.prepare(&[("updatedAt", Utc::now().into())])?;
        self.kv.exec(Batch::new().hset(keys::meta(id), fields)).await
    }

    pub async fn set_pipeline(&self, id: &str, pipeline: &Pipeline) -> Result<()> {
        self.ensure_status(id, ProjectStatus::Idle).await?;
        let fields = META_SCHEMA.prepare(&[
            ("pipeline", FieldValue::json(pipeline)?),
            ("updatedAt", Utc::now().into()),
        ])?;
        self.kv.exec(Batch::new().hset(keys::meta(id), fields)).await?;
        debug!(project_id = id, "Pipeline set");
        Ok(())
    }

    /// Uploads the input and records it. The declared `size` is enforced by
    /// the storage backend; a mismatch leaves the previous input in place.
    pub async fn set_input_file(
        &self,
        id: &str,
        filename: &str,
        size: u64,
        stream: ByteStream,
    ) -> Result<()> {
        self.ensure_status(id, ProjectStatus::Idle).await?;

        let user_params: UserParams = self.meta(id).await?.json("userParams")?.unwrap_or_default();
        if size > user_params.max_file_size {
            return Err(Error::Validation(format!(
                "File too large: {size} bytes exceeds the {} bytes limit",
                user_params.max_file_size
            )));
        }

        let previous = self.kv.get(&keys::input_obj_key(id)).await?;
        let object_key = self
            .storage
            .upload_file(stream, ObjectType::Input, Some(size))
            .await?;

        let input_file = FileInfo {
            filename: filename.to_string(),
            size,
        };
        let fields = META_SCHEMA.prepare(&[
            ("inputFile", FieldValue::json(&input_file)?),
            ("updatedAt", Utc::now().into()),
        ])?;
        self.kv
            .exec(
                Batch::new()
                    .hset(keys::meta(id), fields)
                    .set(keys::input_obj_key(id), object_key.as_str()),
            )
            .await?;
        debug!(project_id = id, %object_key, size, "Input file set");

        if let Some(previous) = previous {
            if let Err(err) = self.storage.delete_file(&previous).await {
                warn!(project_id = id, object_key = %previous, error = %err, "Failed to delete replaced input");
            }
        }
        Ok(())
    }

    /// Moves an idle, fully configured project to the waiting queue.
    /// Concurrent calls collapse into a single enqueue.
    pub async fn ask_processing(&self, id: &str) -> Result<()> {
        let meta = self.meta(id).await?;
        let actual = status_of(&meta)?;
        if actual != Some(ProjectStatus::Idle) {
            return Err(Error::conflict(id, ProjectStatus::Idle, actual));
        }
        if meta.json::<Pipeline>("pipeline")?.is_none() {
            return Err(Error::Validation(
                "Pipeline must be defined before asking for processing".into(),
            ));
        }
        if meta.json::<FileInfo>("inputFile")?.is_none() {
            return Err(Error::Validation(
                "Input file must be uploaded before asking for processing".into(),
            ));
        }

        let guard = keys::processing_asked(id);
        if !self.kv.set_nx(&guard, "1", ASK_GUARD_TTL).await? {
            debug!(project_id = id, "Processing already asked");
            return Ok(());
        }

        // a concurrent caller may have enqueued and released the guard since
        // the first check
        let actual = self.status(id).await?;
        if actual != Some(ProjectStatus::Idle) {
            self.kv.exec(Batch::new().del(guard)).await?;
            return Err(Error::conflict(id, ProjectStatus::Idle, actual));
        }

        let enqueue = Batch::new()
            .hset(keys::meta(id), meta_status(ProjectStatus::Waiting, Utc::now())?)
            .del(guard.as_str())
            .rpush(keys::WAITING_QUEUE, id);
        if let Err(err) = self.kv.exec(enqueue).await {
            // nothing was enqueued, a retry must be able to take the guard again
            if let Err(release) = self.kv.exec(Batch::new().del(guard)).await {
                warn!(project_id = id, error = %release, "Failed to release processing guard");
            }
            return Err(err);
        }
        debug!(project_id = id, "Project enqueued");
        Ok(())
    }

    /// Claims the head of the waiting queue, if any.
    pub async fn process_next(&self) -> Result<Option<String>> {
        let Some(id) = self.kv.lpop(keys::WAITING_QUEUE).await? else {
            return Ok(None);
        };

        if let Err(err) = self.claim(&id).await {
            // back to the head so the project keeps its turn
            if let Err(requeue) = self.kv.exec(Batch::new().lpush(keys::WAITING_QUEUE, id.as_str())).await {
                warn!(project_id = %id, error = %requeue, "Failed to requeue unclaimed project");
            }
            return Err(err);
        }
        debug!(project_id = %id, "Project claimed");
        Ok(Some(id))
    }

    async fn claim(&self, id: &str) -> Result<()> {
        let now = Utc::now();
        let processing = PROCESSING_SCHEMA.prepare(&[
            ("step", ProcessingStep::Starting.as_str().into()),
            ("startedAt", now.into()),
        ])?;
        self.kv
            .exec(
                Batch::new()
                    .sadd(keys::PROCESSING_SET, id)
                    .hset(keys::meta(id), meta_status(ProjectStatus::Processing, now)?)
                    .del(keys::processing(id))
                    .hset(keys::processing(id), processing),
            )
            .await
    }

    pub async fn update_processing(&self, id: &str, update: &ProcessingUpdate) -> Result<()> {
        self.ensure_status(id, ProjectStatus::Processing).await?;
        let mut values = update.values()?;
        values.push(("heartbeat", Utc::now().into()));
        let fields = PROCESSING_SCHEMA.prepare(&values)?;
        self.kv.exec(Batch::new().hset(keys::processing(id), fields)).await
    }

    /// Streams the encoded output to storage and records it.
    pub async fn set_output_file(&self, id: &str, filename: &str, stream: ByteStream) -> Result<()> {
        self.ensure_status(id, ProjectStatus::Processing).await?;

        let previous = self.kv.get(&keys::output_obj_key(id)).await?;
        let object_key = self
            .storage
            .upload_file(stream, ObjectType::Output, None)
            .await?;
        let size = self.storage.get_file_size(&object_key).await?;

        let output_file = FileInfo {
            filename: filename.to_string(),
            size,
        };
        let fields = META_SCHEMA.prepare(&[
            ("outputFile", FieldValue::json(&output_file)?),
            ("updatedAt", Utc::now().into()),
        ])?;
        self.kv
            .exec(
                Batch::new()
                    .hset(keys::meta(id), fields)
                    .set(keys::output_obj_key(id), object_key.as_str()),
            )
            .await?;
        debug!(project_id = id, %object_key, size, "Output file set");

        if let Some(previous) = previous {
            if let Err(err) = self.storage.delete_file(&previous).await {
                warn!(project_id = id, object_key = %previous, error = %err, "Failed to delete replaced output");
            }
        }
        Ok(())
    }

    /// Terminates a claimed project: `completed` without error, `failed` with one.
    pub async fn end_processing(&self, id: &str, error: Option<&str>) -> Result<()> {
        self.ensure_status(id, ProjectStatus::Processing).await?;

        let now = Utc::now();
        let (status, step) = match error {
            None => (ProjectStatus::Completed, ProcessingStep::Completed),
            Some(_) => (ProjectStatus::Failed, ProcessingStep::Failed),
        };
        let mut values: Vec<(&str, FieldValue)> =
            vec![("step", step.as_str().into()), ("finishedAt", now.into())];
        if let Some(message) = error {
            values.push(("globalError", message.into()));
        }

        self.kv
            .exec(
                Batch::new()
                    .srem(keys::PROCESSING_SET, id)
                    .hset(keys::meta(id), meta_status(status, now)?)
                    .hset(keys::processing(id), PROCESSING_SCHEMA.prepare(&values)?)
                    .hdel(keys::processing(id), &["heartbeat"]),
            )
            .await?;
        debug!(project_id = id, %status, "Processing ended");
        Ok(())
    }

    /// Forces any project back to `idle`, dropping its output and substate.
    pub async fn reset_processing(&self, id: &str) -> Result<()> {
        let output = self.kv.get(&keys::output_obj_key(id)).await?;

        self.kv
            .exec(
                Batch::new()
                    .del(keys::processing_asked(id))
                    .lrem(keys::WAITING_QUEUE, id)
                    .srem(keys::PROCESSING_SET, id)
                    .hset(keys::meta(id), meta_status(ProjectStatus::Idle, Utc::now())?)
                    .hdel(keys::meta(id), &["outputFile"])
                    .del(keys::processing(id))
                    .del(keys::output_obj_key(id)),
            )
            .await?;
        debug!(project_id = id, "Processing reset");

        if let Some(object_key) = output {
            if let Err(err) = self.storage.delete_file(&object_key).await {
                warn!(project_id = id, %object_key, error = %err, "Failed to delete discarded output");
            }
        }
        Ok(())
    }

    /// Claimed projects whose heartbeat is older than [`STALL_THRESHOLD`].
    pub async fn get_stalled_projects(&self) -> Result<Vec<String>> {
        let threshold = chrono::Duration::from_std(STALL_THRESHOLD)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        let deadline = Utc::now() - threshold;

        let mut stalled = Vec::new();
        for id in self.kv.smembers(keys::PROCESSING_SET).await? {
            let Some(raw) = self.kv.hget(&keys::processing(&id), "heartbeat").await? else {
                continue;
            };
            let heartbeat = DateTime::parse_from_rfc3339(&raw)
                .map_err(|_| Error::Serialization(format!("invalid heartbeat {raw} for project {id}")))?
                .with_timezone(&Utc);
            if heartbeat < deadline {
                stalled.push(id);
            }
        }
        Ok(stalled)
    }

    pub async fn get_input_file_download_stream(&self, id: &str) -> Result<ByteStream> {
        let object_key = self
            .kv
            .get(&keys::input_obj_key(id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("input file of project {id}")))?;
        self.storage.create_download_stream(&object_key).await
    }

    pub async fn get_output_file_download_stream(&self, id: &str) -> Result<ByteStream> {
        let object_key = self
            .kv
            .get(&keys::output_obj_key(id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("output file of project {id}")))?;
        self.storage.create_download_stream(&object_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{Command, FlakyStore, MemoryStore};
    use crate::pipeline::validate_pipeline;
    use crate::storage::FsStorage;
    use bytes::Bytes;
    use futures::{stream, StreamExt, TryStreamExt};
    use serde_json::json;
    use tempfile::TempDir;

    const INPUT: &str = "id,adresse\n1,8 bd du port\n";

    struct Fixture {
        store: Arc<ProjectStore>,
        kv: Arc<MemoryStore>,
        _dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let storage = Storage::Fs(FsStorage::new(dir.path()).await.unwrap());
        let kv = Arc::new(MemoryStore::new());
        let store = ProjectStore::new(kv.clone(), Arc::new(storage));
        Fixture {
            store: Arc::new(store),
            kv,
            _dir: dir,
        }
    }

    fn body(text: &'static str) -> ByteStream {
        stream::iter(vec![Ok(Bytes::from_static(text.as_bytes()))]).boxed()
    }

    fn pipeline() -> Pipeline {
        validate_pipeline(&json!({
            "format": "csv",
            "formatOptions": {},
            "geocodeOptions": {"q": "adresse"},
            "outputFormat": "csv",
            "outputFormatOptions": {}
        }))
        .unwrap()
    }

    async fn configured(store: &ProjectStore) -> String {
        let id = store.create_project().await.unwrap().project.id;
        store.set_pipeline(&id, &pipeline()).await.unwrap();
        store
            .set_input_file(&id, "input.csv", INPUT.len() as u64, body(INPUT))
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn created_project_is_idle_and_token_checks() {
        let f = fixture().await;
        let created = f.store.create_project().await.unwrap();
        let id = &created.project.id;

        assert_eq!(id.len(), 10);
        assert_eq!(created.token.len(), 24);

        let project = f.store.get_project(id).await.unwrap();
        assert_eq!(project.status, ProjectStatus::Idle);
        assert_eq!(project.user_params.max_file_size, DEFAULT_MAX_FILE_SIZE);
        assert_eq!(project.processing, Processing::default());

        assert!(f.store.check_project_token(id, &created.token).await.unwrap());
        assert!(!f.store.check_project_token(id, "nope").await.unwrap());
        assert!(!f.store.check_project_token("", &created.token).await.unwrap());
        assert!(matches!(f.store.authorize(id, "nope").await, Err(Error::Auth)));
        assert!(matches!(
            f.store.get_project("unknown").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn full_lifecycle() {
        let f = fixture().await;
        let id = configured(&f.store).await;

        f.store.ask_processing(&id).await.unwrap();
        assert_eq!(f.store.get_project(&id).await.unwrap().status, ProjectStatus::Waiting);

        assert_eq!(f.store.process_next().await.unwrap().as_deref(), Some(id.as_str()));
        let project = f.store.get_project(&id).await.unwrap();
        assert_eq!(project.status, ProjectStatus::Processing);
        assert_eq!(project.processing.step, Some(ProcessingStep::Starting));
        assert!(project.processing.started_at.is_some());

        f.store
            .update_processing(
                &id,
                &ProcessingUpdate {
                    step: Some(ProcessingStep::Validating),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(f.store.get_project(&id).await.unwrap().processing.heartbeat.is_some());

        f.store
            .set_output_file(&id, "input.geocoded.csv", body("id\n1\n"))
            .await
            .unwrap();
        f.store.end_processing(&id, None).await.unwrap();

        let project = f.store.get_project(&id).await.unwrap();
        assert_eq!(project.status, ProjectStatus::Completed);
        assert_eq!(project.processing.step, Some(ProcessingStep::Completed));
        assert_eq!(project.processing.heartbeat, None);
        assert!(project.processing.finished_at.is_some());
        assert_eq!(
            project.output_file,
            Some(FileInfo {
                filename: "input.geocoded.csv".into(),
                size: 5
            })
        );
        assert!(f.kv.smembers(keys::PROCESSING_SET).await.unwrap().is_empty());

        let output: Vec<Bytes> = f
            .store
            .get_output_file_download_stream(&id)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(output.concat(), b"id\n1\n");
    }

    #[tokio::test]
    async fn failure_records_global_error() {
        let f = fixture().await;
        let id = configured(&f.store).await;
        f.store.ask_processing(&id).await.unwrap();
        f.store.process_next().await.unwrap();

        f.store.end_processing(&id, Some("Validation failed")).await.unwrap();

        let project = f.store.get_project(&id).await.unwrap();
        assert_eq!(project.status, ProjectStatus::Failed);
        assert_eq!(project.processing.global_error.as_deref(), Some("Validation failed"));
    }

    #[tokio::test]
    async fn operations_check_status() {
        let f = fixture().await;
        let id = configured(&f.store).await;

        let err = f
            .store
            .update_processing(&id, &ProcessingUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Conflict {
                expected: ProjectStatus::Processing,
                actual: Some(ProjectStatus::Idle),
                ..
            }
        ));
        assert!(matches!(
            f.store.end_processing(&id, None).await,
            Err(Error::Conflict { .. })
        ));

        f.store.ask_processing(&id).await.unwrap();
        assert!(matches!(
            f.store.set_pipeline(&id, &pipeline()).await,
            Err(Error::Conflict { .. })
        ));
        assert!(matches!(
            f.store.ask_processing(&id).await,
            Err(Error::Conflict { .. })
        ));
        assert!(matches!(
            f.store.set_input_file(&id, "x.csv", 1, body("x")).await,
            Err(Error::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn ask_processing_requires_configuration() {
        let f = fixture().await;
        let id = f.store.create_project().await.unwrap().project.id;
        assert!(matches!(
            f.store.ask_processing(&id).await,
            Err(Error::Validation(_))
        ));

        f.store.set_pipeline(&id, &pipeline()).await.unwrap();
        assert!(matches!(
            f.store.ask_processing(&id).await,
            Err(Error::Validation(_))
        ));
        assert!(f.kv.lrange(keys::WAITING_QUEUE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upload_size_is_enforced() {
        let f = fixture().await;
        let id = f.store.create_project().await.unwrap().project.id;

        let err = f
            .store
            .set_input_file(&id, "input.csv", 100, body(INPUT))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Integrity { expected: 100, .. }));
        assert_eq!(f.store.get_project(&id).await.unwrap().input_file, None);

        let err = f
            .store
            .set_input_file(&id, "input.csv", DEFAULT_MAX_FILE_SIZE + 1, body(INPUT))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_asks_enqueue_once() {
        let f = fixture().await;
        let id = configured(&f.store).await;

        let asks = (0..8).map(|_| {
            let store = Arc::clone(&f.store);
            let id = id.clone();
            tokio::spawn(async move { store.ask_processing(&id).await })
        });
        let results = futures::future::join_all(asks).await;
        assert!(results.into_iter().any(|r| r.unwrap().is_ok()));

        assert_eq!(f.kv.lrange(keys::WAITING_QUEUE).await.unwrap(), vec![id.clone()]);
        assert_eq!(f.store.process_next().await.unwrap(), Some(id));
        assert_eq!(f.store.process_next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn process_next_is_fifo() {
        let f = fixture().await;
        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = configured(&f.store).await;
            f.store.ask_processing(&id).await.unwrap();
            ids.push(id);
        }

        let mut claimed = Vec::new();
        while let Some(id) = f.store.process_next().await.unwrap() {
            claimed.push(id);
        }
        assert_eq!(claimed, ids);

        let mut processing = f.kv.smembers(keys::PROCESSING_SET).await.unwrap();
        processing.sort();
        ids.sort();
        assert_eq!(processing, ids);
    }

    #[tokio::test]
    async fn reset_returns_to_idle_from_any_status() {
        let f = fixture().await;
        let id = configured(&f.store).await;

        f.store.ask_processing(&id).await.unwrap();
        f.store.reset_processing(&id).await.unwrap();
        assert_eq!(f.store.get_project(&id).await.unwrap().status, ProjectStatus::Idle);
        assert!(f.kv.lrange(keys::WAITING_QUEUE).await.unwrap().is_empty());

        f.store.ask_processing(&id).await.unwrap();
        f.store.process_next().await.unwrap();
        f.store.set_output_file(&id, "out.csv", body("id\n")).await.unwrap();
        f.store.end_processing(&id, None).await.unwrap();
        f.store.reset_processing(&id).await.unwrap();

        let project = f.store.get_project(&id).await.unwrap();
        assert_eq!(project.status, ProjectStatus::Idle);
        assert_eq!(project.output_file, None);
        assert_eq!(project.processing, Processing::default());
        assert!(matches!(
            f.store.get_output_file_download_stream(&id).await,
            Err(Error::NotFound(_))
        ));
        // the input survives and the project can be processed again
        f.store.ask_processing(&id).await.unwrap();
    }

    async fn flaky_fixture(kv: Arc<FlakyStore>) -> (Arc<ProjectStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::Fs(FsStorage::new(dir.path()).await.unwrap());
        (Arc::new(ProjectStore::new(kv, Arc::new(storage))), dir)
    }

    #[tokio::test]
    async fn failed_enqueue_can_be_retried() {
        let kv = Arc::new(FlakyStore::new(|c| matches!(c, Command::RPush { .. }), 1));
        let (store, _dir) = flaky_fixture(kv.clone()).await;
        let id = configured(&store).await;

        assert!(matches!(store.ask_processing(&id).await, Err(Error::Store { .. })));
        assert_eq!(store.get_project(&id).await.unwrap().status, ProjectStatus::Idle);
        assert_eq!(kv.get(&keys::processing_asked(&id)).await.unwrap(), None);

        store.ask_processing(&id).await.unwrap();
        assert_eq!(store.get_project(&id).await.unwrap().status, ProjectStatus::Waiting);
        assert_eq!(kv.lrange(keys::WAITING_QUEUE).await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn failed_claim_keeps_the_project_at_the_head() {
        let kv = Arc::new(FlakyStore::new(|c| matches!(c, Command::SAdd { .. }), 1));
        let (store, _dir) = flaky_fixture(kv.clone()).await;
        let first = configured(&store).await;
        let second = configured(&store).await;
        store.ask_processing(&first).await.unwrap();
        store.ask_processing(&second).await.unwrap();

        assert!(matches!(store.process_next().await, Err(Error::Store { .. })));
        assert_eq!(store.get_project(&first).await.unwrap().status, ProjectStatus::Waiting);
        assert_eq!(
            kv.lrange(keys::WAITING_QUEUE).await.unwrap(),
            vec![first.clone(), second.clone()]
        );
        assert!(kv.smembers(keys::PROCESSING_SET).await.unwrap().is_empty());

        assert_eq!(store.process_next().await.unwrap(), Some(first.clone()));
        assert_eq!(store.get_project(&first).await.unwrap().status, ProjectStatus::Processing);
    }

    #[tokio::test]
    async fn stalled_projects_need_an_old_heartbeat() {
        let f = fixture().await;
        let mut claimed = Vec::new();
        for _ in 0..3 {
            let id = configured(&f.store).await;
            f.store.ask_processing(&id).await.unwrap();
            f.store.process_next().await.unwrap();
            claimed.push(id);
        }
        let (old, fresh, silent) = (&claimed[0], &claimed[1], &claimed[2]);

        let heartbeat =
            |at: DateTime<Utc>| PROCESSING_SCHEMA.prepare(&[("heartbeat", at.into())]).unwrap();
        f.kv
            .exec(
                Batch::new()
                    .hset(keys::processing(old), heartbeat(Utc::now() - chrono::Duration::minutes(3)))
                    .hset(keys::processing(fresh), heartbeat(Utc::now())),
            )
            .await
            .unwrap();

        let stalled = f.store.get_stalled_projects().await.unwrap();
        assert_eq!(stalled, vec![old.clone()]);
        assert!(!stalled.contains(silent));
    }
}
