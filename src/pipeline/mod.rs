//! Pipeline definitions and the row-stream stages a job is built from.
//!
//! A job reads CSV bytes, turns them into [`Row`]s, geocodes them and encodes
//! the result as CSV or GeoJSON. Every stage is a pull-based stream, so the
//! upload at the end of the chain sets the pace for the whole pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

pub mod csv;
pub mod geocode;
pub mod geojson;

/// One decoded record, columns in input order.
pub type Row = Map<String, Value>;

pub const PIPELINE_KEYS: [&str; 5] = [
    "format",
    "formatOptions",
    "geocodeOptions",
    "outputFormat",
    "outputFormatOptions",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputFormat {
    Csv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Csv,
    Geojson,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Geojson => "geojson",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_char: Option<String>,
}

impl FormatOptions {
    pub fn delimiter_byte(&self) -> Result<u8> {
        single_byte("delimiter", self.delimiter.as_deref(), b',')
    }

    pub fn quote_byte(&self) -> Result<u8> {
        single_byte("quoteChar", self.quote_char.as_deref(), b'"')
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Columns {
    One(String),
    Many(Vec<String>),
}

impl Columns {
    pub fn names(&self) -> Vec<&str> {
        match self {
            Self::One(name) => vec![name.as_str()],
            Self::Many(names) => names.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeocodeOptions {
    pub q: Columns,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citycode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<String>,
}

impl GeocodeOptions {
    pub fn lon_column(&self) -> &str {
        self.lon.as_deref().unwrap_or("longitude")
    }

    pub fn lat_column(&self) -> &str {
        self.lat.as_deref().unwrap_or("latitude")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputFormatOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<String>,
}

impl OutputFormatOptions {
    pub fn delimiter_byte(&self) -> Result<u8> {
        single_byte("delimiter", self.delimiter.as_deref(), b',')
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    pub format: InputFormat,
    pub format_options: FormatOptions,
    pub geocode_options: GeocodeOptions,
    pub output_format: OutputFormat,
    pub output_format_options: OutputFormatOptions,
}

fn single_byte(name: &str, value: Option<&str>, default: u8) -> Result<u8> {
    match value {
        None => Ok(default),
        Some(s) if s.len() == 1 && s.is_ascii() => Ok(s.as_bytes()[0]),
        Some(s) => Err(Error::Validation(format!(
            "{name} must be a single ASCII character, got {s:?}"
        ))),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Checks a client-supplied pipeline and keeps only the known keys.
pub fn validate_pipeline(raw: &Value) -> Result<Pipeline> {
    let object = raw
        .as_object()
        .ok_or_else(|| Error::Validation("Pipeline definition must be an object".into()))?;

    if let Some(missing) = PIPELINE_KEYS
        .iter()
        .find(|key| !object.get(**key).is_some_and(is_truthy))
    {
        return Err(Error::Validation(format!(
            "Missing key {missing} in pipeline definition"
        )));
    }

    let format = &object["format"];
    if format.as_str() != Some("csv") {
        return Err(Error::Validation(format!("Format not supported: {}", display(format))));
    }

    let output_format = &object["outputFormat"];
    if !matches!(output_format.as_str(), Some("csv" | "geojson")) {
        return Err(Error::Validation(format!(
            "Output format not supported: {}",
            display(output_format)
        )));
    }

    let picked: Map<String, Value> = PIPELINE_KEYS
        .iter()
        .map(|key| (key.to_string(), object[*key].clone()))
        .collect();
    let pipeline: Pipeline = serde_json::from_value(Value::Object(picked))
        .map_err(|e| Error::Validation(format!("Invalid pipeline definition: {e}")))?;

    pipeline.format_options.delimiter_byte()?;
    pipeline.format_options.quote_byte()?;
    pipeline.output_format_options.delimiter_byte()?;

    Ok(pipeline)
}

fn display(value: &Value) -> String {
    value
        .as_str()
        .map_or_else(|| value.to_string(), str::to_string)
}

/// Derives the output name: the last extension is replaced by
/// `.geocoded.<ext>`, dotfiles and extension-less names get it appended.
pub fn compute_output_filename(original_name: &str, output_format: OutputFormat) -> String {
    let ext = output_format.extension();
    match original_name.rfind('.') {
        None | Some(0) => format!("{original_name}.geocoded.{ext}"),
        Some(pos) => format!("{}.geocoded.{ext}", &original_name[..pos]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid() -> Value {
        json!({
            "format": "csv",
            "formatOptions": {"delimiter": ";"},
            "geocodeOptions": {"q": ["numero", "voie"], "citycode": "insee"},
            "outputFormat": "geojson",
            "outputFormatOptions": {},
            "extra": true
        })
    }

    #[test]
    fn output_filename() {
        use OutputFormat::*;
        assert_eq!(compute_output_filename("file1.csv", Csv), "file1.geocoded.csv");
        assert_eq!(compute_output_filename("file1.csv", Geojson), "file1.geocoded.geojson");
        assert_eq!(compute_output_filename("file1.tsv", Csv), "file1.geocoded.csv");
        assert_eq!(
            compute_output_filename("file1.csv.tsv", Geojson),
            "file1.csv.geocoded.geojson"
        );
        assert_eq!(compute_output_filename("file1", Csv), "file1.geocoded.csv");
        assert_eq!(compute_output_filename("file1.", Csv), "file1.geocoded.csv");
        assert_eq!(compute_output_filename(".file1", Csv), ".file1.geocoded.csv");
    }

    #[test]
    fn accepts_valid_pipeline_and_drops_unknown_keys() {
        let pipeline = validate_pipeline(&valid()).unwrap();
        assert_eq!(pipeline.output_format, OutputFormat::Geojson);
        assert_eq!(pipeline.format_options.delimiter_byte().unwrap(), b';');
        assert_eq!(pipeline.geocode_options.q.names(), vec!["numero", "voie"]);
        assert_eq!(pipeline.geocode_options.lon_column(), "longitude");

        let reserialized = serde_json::to_value(&pipeline).unwrap();
        assert!(reserialized.get("extra").is_none());
    }

    #[test]
    fn rejects_missing_or_falsy_keys() {
        for key in PIPELINE_KEYS {
            let mut raw = valid();
            raw.as_object_mut().unwrap().remove(key);
            let err = validate_pipeline(&raw).unwrap_err();
            assert_eq!(err.to_string(), format!("Missing key {key} in pipeline definition"));
        }

        let mut raw = valid();
        raw["format"] = json!("");
        assert!(matches!(validate_pipeline(&raw), Err(Error::Validation(_))));
    }

    #[test]
    fn rejects_unsupported_formats() {
        let mut raw = valid();
        raw["format"] = json!("xlsx");
        assert_eq!(
            validate_pipeline(&raw).unwrap_err().to_string(),
            "Format not supported: xlsx"
        );

        let mut raw = valid();
        raw["outputFormat"] = json!("kml");
        assert_eq!(
            validate_pipeline(&raw).unwrap_err().to_string(),
            "Output format not supported: kml"
        );
    }

    #[test]
    fn rejects_multi_character_delimiter() {
        let mut raw = valid();
        raw["formatOptions"] = json!({"delimiter": "::"});
        assert!(matches!(validate_pipeline(&raw), Err(Error::Validation(_))));
    }
}
