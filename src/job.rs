use std::sync::Arc;

use anyhow::{anyhow, Context, Error};
use futures::stream::BoxStream;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::*;

use crate::pipeline::csv::{self, ValidationProgress};
use crate::pipeline::geocode::{geocode_rows, output_columns, Geocoder, GeocodingProgress};
use crate::pipeline::{compute_output_filename, geojson, OutputFormat, Pipeline, Row};
use crate::project::{ProcessingStep, ProcessingUpdate, ProjectStore};
use crate::storage::ByteStream;

pub const DEFAULT_GEOCODE_BATCH_SIZE: usize = 50;

/// Shared dependencies of every job run by a worker pool.
pub struct JobContext {
    pub store: Arc<ProjectStore>,
    pub geocoder: Arc<dyn Geocoder>,
    pub geocode_batch_size: usize,
}

/// Applies progress updates one at a time, in the order they were sent.
fn spawn_updater(
    store: Arc<ProjectStore>,
    project_id: String,
) -> (UnboundedSender<ProcessingUpdate>, JoinHandle<()>) {
    let (send_update, mut recv_update) = mpsc::unbounded_channel::<ProcessingUpdate>();
    let handle = tokio::spawn(
        async move {
            while let Some(update) = recv_update.recv().await {
                if let Err(err) = store.update_processing(&project_id, &update).await {
                    warn!(message = "Failed to record progress", error = %err);
                }
            }
        }
        .in_current_span(),
    );
    (send_update, handle)
}

fn encode(
    rows: BoxStream<'static, crate::Result<Row>>,
    headers: &[String],
    pipeline: &Pipeline,
) -> crate::Result<ByteStream> {
    Ok(match pipeline.output_format {
        OutputFormat::Csv => csv::encode(
            rows,
            pipeline.output_format_options.delimiter_byte()?,
            output_columns(headers, &pipeline.geocode_options),
        ),
        OutputFormat::Geojson => geojson::encode(
            rows,
            pipeline.geocode_options.lon_column().to_string(),
            pipeline.geocode_options.lat_column().to_string(),
        ),
    })
}

/// Runs one claimed project end to end. The caller owns `end_processing`.
#[instrument(skip(ctx))]
pub async fn run(ctx: &JobContext, project_id: &str) -> Result<(), Error> {
    let (progress, updater) = spawn_updater(Arc::clone(&ctx.store), project_id.to_string());
    let result = execute(ctx, project_id, &progress).await;

    // every queued update lands before the caller ends processing
    drop(progress);
    updater.await.context("progress updater panicked")?;

    result
}

async fn execute(
    ctx: &JobContext,
    project_id: &str,
    progress: &UnboundedSender<ProcessingUpdate>,
) -> Result<(), Error> {
    info!("Start processing");
    let send = |update: ProcessingUpdate| {
        // the receiver outlives this function
        let _ = progress.send(update);
    };

    let project = ctx.store.get_project(project_id).await?;
    let pipeline = project
        .pipeline
        .ok_or_else(|| anyhow!("Project {project_id} has no pipeline"))?;
    let input_file = project
        .input_file
        .ok_or_else(|| anyhow!("Project {project_id} has no input file"))?;

    // Validation

    send(ProcessingUpdate {
        step: Some(ProcessingStep::Validating),
        validation_progress: Some(ValidationProgress {
            read_rows: 0,
            read_bytes: 0,
            total_bytes: input_file.size,
        }),
        ..Default::default()
    });

    let input = ctx.store.get_input_file_download_stream(project_id).await?;
    let validated = csv::validate(input, input_file.size, &pipeline.format_options, |p| {
        send(ProcessingUpdate {
            validation_progress: Some(p),
            ..Default::default()
        })
    })
    .await;

    let validated = match validated {
        Ok(validated) => validated,
        Err(err) => {
            debug!(message = "Validation failed", error = %err);
            send(ProcessingUpdate {
                validation_error: Some(err.to_string()),
                ..Default::default()
            });
            return Err(anyhow!("Validation failed"));
        }
    };
    send(ProcessingUpdate {
        validation_progress: Some(validated),
        ..Default::default()
    });

    // Geocoding

    let total_rows = Some(validated.read_rows);
    send(ProcessingUpdate {
        step: Some(ProcessingStep::Geocoding),
        geocoding_progress: Some(GeocodingProgress {
            read_rows: 0,
            total_rows,
        }),
        ..Default::default()
    });

    let input_name = match input_file.filename.as_str() {
        "" => "result",
        name => name,
    };
    let output_filename = compute_output_filename(input_name, pipeline.output_format);

    let geocode_progress = progress.clone();
    let geocoded = async {
        let input = ctx.store.get_input_file_download_stream(project_id).await?;
        let parsed = csv::parse(input, &pipeline.format_options).await?;
        let rows = geocode_rows(
            parsed.rows,
            Arc::clone(&ctx.geocoder),
            pipeline.geocode_options.clone(),
            ctx.geocode_batch_size,
            move |read_rows| {
                let _ = geocode_progress.send(ProcessingUpdate {
                    geocoding_progress: Some(GeocodingProgress {
                        read_rows,
                        total_rows,
                    }),
                    ..Default::default()
                });
            },
        );
        let output = encode(rows, &parsed.headers, &pipeline)?;
        ctx.store
            .set_output_file(project_id, &output_filename, output)
            .await
    }
    .await;

    if let Err(err) = geocoded {
        debug!(message = "Geocoding failed", error = %err);
        send(ProcessingUpdate {
            geocoding_error: Some(err.to_string()),
            ..Default::default()
        });
        return Err(anyhow!("Geocoding failed"));
    }

    info!(message = "Processed successfully", output = %output_filename);
    Ok(())
}
