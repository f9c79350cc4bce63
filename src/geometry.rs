//! GeoJSON to WKT, for the `geometry` search term.
use serde_json::Value;

use crate::error::{Error, Result};

fn invalid(message: &str) -> Error {
    Error::InvalidSearchTerms(format!("Unsupported GeoJSON: {}", message))
}

/// Converts a Polygon, given bare or wrapped in a Feature or a single-feature
/// FeatureCollection, to `POLYGON((x y, ...))`. Only the exterior ring is kept.
pub fn geojson_to_wkt(geojson: &Value) -> Result<String> {
    let geometry = match geojson.get("type").and_then(Value::as_str) {
        Some("Feature") => geojson.get("geometry").ok_or_else(|| invalid("feature without geometry"))?,
        Some("FeatureCollection") => match geojson.get("features").and_then(Value::as_array) {
            Some(features) if features.len() == 1 => features[0]
                .get("geometry")
                .ok_or_else(|| invalid("feature without geometry"))?,
            _ => return Err(invalid("expected exactly one feature in the collection")),
        },
        _ => geojson,
    };

    if geometry.get("type").and_then(Value::as_str) != Some("Polygon") {
        return Err(invalid("only Polygon geometries are supported"));
    }
    let ring = geometry
        .get("coordinates")
        .and_then(|c| c.get(0))
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("polygon without an exterior ring"))?;

    let points = ring
        .iter()
        .map(|position| match position.as_array().map(Vec::as_slice) {
            Some([Value::Number(x), Value::Number(y), ..]) => Ok(format!("{} {}", x, y)),
            _ => Err(invalid("positions must hold two numbers")),
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(format!("POLYGON(({}))", points.join(", ")))
}

pub fn geojson_str_to_wkt(geojson: &str) -> Result<String> {
    geojson_to_wkt(&serde_json::from_str(geojson)?)
}
