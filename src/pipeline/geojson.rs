use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use serde_json::{json, Value};

use super::Row;
use crate::error::{Error, Result};
use crate::storage::ByteStream;

pub const GEOJSON_OPEN: &str = "{\"type\":\"FeatureCollection\",\"features\": [\n";
pub const GEOJSON_SEP: &str = ",\n";
pub const GEOJSON_CLOSE: &str = "\n]}\n";

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

fn coordinate(value: Value) -> Value {
    match value {
        Value::String(s) => s
            .parse::<f64>()
            .ok()
            .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
            .unwrap_or(Value::String(s)),
        other => other,
    }
}

/// Turns a row into a Feature, moving the coordinate columns into a Point.
pub fn to_feature(mut row: Row, lon: &str, lat: &str) -> Value {
    let has_point = is_truthy(row.get(lon)) && is_truthy(row.get(lat));
    let lon_value = row.shift_remove(lon);
    let lat_value = row.shift_remove(lat);

    let geometry = match (has_point, lon_value, lat_value) {
        (true, Some(lon), Some(lat)) => json!({
            "type": "Point",
            "coordinates": [coordinate(lon), coordinate(lat)],
        }),
        _ => Value::Null,
    };

    json!({
        "type": "Feature",
        "geometry": geometry,
        "properties": Value::Object(row),
    })
}

/// Encodes rows as one FeatureCollection, one feature per line.
pub fn encode(rows: BoxStream<'static, Result<Row>>, lon: String, lat: String) -> ByteStream {
    let features = rows.enumerate().map(move |(index, row)| -> Result<Bytes> {
        let feature = to_feature(row?, &lon, &lat);
        let mut text = if index == 0 {
            String::new()
        } else {
            GEOJSON_SEP.to_string()
        };
        text.push_str(&feature.to_string());
        Ok(Bytes::from(text))
    });

    stream::once(async { Ok::<_, Error>(Bytes::from_static(GEOJSON_OPEN.as_bytes())) })
        .chain(features)
        .chain(stream::once(async {
            Ok(Bytes::from_static(GEOJSON_CLOSE.as_bytes()))
        }))
        .map_err(std::io::Error::from)
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn row_with_coordinates_becomes_point() {
        let feature = to_feature(
            row(json!({"id": "1", "longitude": "2.29", "latitude": "48.85", "label": "Paris"})),
            "longitude",
            "latitude",
        );
        assert_eq!(
            feature,
            json!({
                "type": "Feature",
                "geometry": {"type": "Point", "coordinates": [2.29, 48.85]},
                "properties": {"id": "1", "label": "Paris"},
            })
        );
    }

    #[test]
    fn row_without_coordinates_has_null_geometry() {
        let feature = to_feature(
            row(json!({"id": "1", "longitude": "", "latitude": "48.85"})),
            "longitude",
            "latitude",
        );
        assert_eq!(feature["geometry"], Value::Null);
        assert_eq!(feature["properties"], json!({"id": "1"}));

        let feature = to_feature(row(json!({"id": "2", "lat": 1.5})), "lon", "lat");
        assert_eq!(feature["geometry"], Value::Null);
    }

    #[tokio::test]
    async fn stream_is_a_valid_feature_collection() {
        let rows = stream::iter(vec![
            Ok(row(json!({"id": "1", "x": 1.0, "y": 2.0}))),
            Ok(row(json!({"id": "2", "x": null, "y": null}))),
            Ok(row(json!({"id": "3", "x": 3.0, "y": 4.0}))),
        ])
        .boxed();

        let chunks: Vec<Bytes> = encode(rows, "x".into(), "y".into())
            .try_collect()
            .await
            .unwrap();
        let text = String::from_utf8(chunks.concat()).unwrap();
        assert!(text.starts_with(GEOJSON_OPEN));
        assert!(text.ends_with(GEOJSON_CLOSE));

        let document: Value = serde_json::from_str(&text).unwrap();
        let features = document["features"].as_array().unwrap();
        assert_eq!(features.len(), 3);
        assert_eq!(features[0]["geometry"]["coordinates"], json!([1.0, 2.0]));
        assert_eq!(features[1]["geometry"], Value::Null);
    }

    #[tokio::test]
    async fn empty_input_gives_empty_collection() {
        let rows = stream::iter(Vec::<Result<Row>>::new()).boxed();
        let chunks: Vec<Bytes> = encode(rows, "x".into(), "y".into())
            .try_collect()
            .await
            .unwrap();
        let document: Value = serde_json::from_slice(&chunks.concat()).unwrap();
        assert_eq!(document, json!({"type": "FeatureCollection", "features": []}));
    }
}
