use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use tracing::debug;

use super::{GeocodeOptions, Row};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeocodeQuery {
    pub q: String,
    pub citycode: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeocodeResult {
    pub lon: f64,
    pub lat: f64,
    pub label: Option<String>,
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeocodingProgress {
    pub read_rows: u64,
    pub total_rows: Option<u64>,
}

/// Resolves a batch of queries; the result has one entry per query, in order.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, queries: &[GeocodeQuery]) -> Result<Vec<Option<GeocodeResult>>>;
}

fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
    .filter(|s| !s.is_empty())
}

pub fn query_for(row: &Row, options: &GeocodeOptions) -> GeocodeQuery {
    let q = options
        .q
        .names()
        .into_iter()
        .filter_map(|column| text(row.get(column)))
        .collect::<Vec<_>>()
        .join(" ");
    let citycode = options
        .citycode
        .as_deref()
        .and_then(|column| text(row.get(column)));
    GeocodeQuery { q, citycode }
}

fn result_columns(options: &GeocodeOptions) -> [&str; 4] {
    [options.lon_column(), options.lat_column(), "result_label", "result_score"]
}

/// Columns of a geocoded row: the input headers followed by the result
/// columns they do not already contain.
pub fn output_columns(headers: &[String], options: &GeocodeOptions) -> Vec<String> {
    let mut columns = headers.to_vec();
    for column in result_columns(options) {
        if !columns.iter().any(|c| c == column) {
            columns.push(column.to_string());
        }
    }
    columns
}

fn number(value: f64) -> Value {
    Number::from_f64(value).map_or(Value::Null, Value::Number)
}

fn apply(mut row: Row, result: Option<GeocodeResult>, options: &GeocodeOptions) -> Row {
    let empty = || Value::String(String::new());
    match result {
        Some(result) => {
            row.insert(options.lon_column().to_string(), number(result.lon));
            row.insert(options.lat_column().to_string(), number(result.lat));
            row.insert(
                "result_label".into(),
                result.label.map_or_else(empty, Value::String),
            );
            row.insert(
                "result_score".into(),
                result.score.map_or_else(empty, number),
            );
        }
        None => {
            for column in result_columns(options) {
                row.insert(column.to_string(), empty());
            }
        }
    }
    row
}

/// Geocodes rows batch by batch, keeping input order. `on_progress` receives
/// the running count of geocoded rows after each batch.
pub fn geocode_rows<F>(
    rows: BoxStream<'static, Result<Row>>,
    geocoder: Arc<dyn Geocoder>,
    options: GeocodeOptions,
    batch_size: usize,
    on_progress: F,
) -> BoxStream<'static, Result<Row>>
where
    F: FnMut(u64) + Send + 'static,
{
    let chunks = rows.chunks(batch_size.max(1)).boxed();
    let state = (chunks, geocoder, options, on_progress, 0u64);

    stream::try_unfold(
        state,
        |(mut chunks, geocoder, options, mut on_progress, mut done)| async move {
            let Some(chunk) = chunks.next().await else {
                return Ok(None);
            };
            let rows = chunk.into_iter().collect::<Result<Vec<Row>>>()?;
            let queries: Vec<GeocodeQuery> =
                rows.iter().map(|row| query_for(row, &options)).collect();

            let results = geocoder.geocode(&queries).await?;
            if results.len() != rows.len() {
                return Err(Error::Processing(format!(
                    "geocoder returned {} results for {} rows",
                    results.len(),
                    rows.len()
                )));
            }

            let geocoded: Vec<Row> = rows
                .into_iter()
                .zip(results)
                .map(|(row, result)| apply(row, result, &options))
                .collect();
            done += geocoded.len() as u64;
            on_progress(done);

            let batch = stream::iter(geocoded.into_iter().map(Ok::<Row, Error>));
            Ok::<_, Error>(Some((batch, (chunks, geocoder, options, on_progress, done))))
        },
    )
    .try_flatten()
    .boxed()
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    features: Vec<SearchFeature>,
}

#[derive(Debug, Deserialize)]
struct SearchFeature {
    geometry: SearchGeometry,
    #[serde(default)]
    properties: SearchProperties,
}

#[derive(Debug, Deserialize)]
struct SearchGeometry {
    coordinates: [f64; 2],
}

#[derive(Debug, Default, Deserialize)]
struct SearchProperties {
    label: Option<String>,
    score: Option<f64>,
}

impl SearchResponse {
    fn into_best(self) -> Option<GeocodeResult> {
        self.features.into_iter().next().map(|f| GeocodeResult {
            lon: f.geometry.coordinates[0],
            lat: f.geometry.coordinates[1],
            label: f.properties.label,
            score: f.properties.score,
        })
    }
}

/// Client for an Addok search endpoint (`GET /search/?q=...&limit=1`).
pub struct AddokGeocoder {
    client: reqwest::Client,
    base_url: String,
    concurrency: usize,
}

fn request_error(err: reqwest::Error) -> Error {
    Error::Processing(format!("geocoding request failed: {err}"))
}

impl AddokGeocoder {
    pub fn new(base_url: impl Into<String>, concurrency: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("geoq/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Validation(format!("cannot build geocoding client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            concurrency: concurrency.max(1),
        })
    }

    async fn search(&self, query: &GeocodeQuery) -> Result<Option<GeocodeResult>> {
        if query.q.is_empty() {
            return Ok(None);
        }

        let mut params = vec![("q", query.q.as_str()), ("limit", "1")];
        if let Some(citycode) = &query.citycode {
            params.push(("citycode", citycode.as_str()));
        }

        let response: SearchResponse = self
            .client
            .get(format!("{}/search/", self.base_url))
            .query(&params)
            .send()
            .await
            .map_err(request_error)?
            .error_for_status()
            .map_err(request_error)?
            .json()
            .await
            .map_err(request_error)?;

        Ok(response.into_best())
    }
}

#[async_trait]
impl Geocoder for AddokGeocoder {
    async fn geocode(&self, queries: &[GeocodeQuery]) -> Result<Vec<Option<GeocodeResult>>> {
        debug!(batch = queries.len(), "Geocoding batch");
        let searches: Vec<_> = queries.iter().map(|query| self.search(query)).collect();
        stream::iter(searches)
            .buffered(self.concurrency)
            .try_collect()
            .await
    }
}
