//! # Map Matcher
//!
//! Snap noisy GPS traces onto the road network via a remote map-matching
//! service.
//!
//! The pipeline takes a GeoJSON feature collection of LineString traces,
//! filters out redundant points, splits the result into API-sized chunks,
//! POSTs every chunk to the matching service concurrently, decodes the
//! compact polyline geometries in each response, and reassembles the chunks
//! into a single corrected trace in original order.
//!
//! - [`simplify`] - noise filtering and chunking
//! - [`dispatch`] - concurrent, order-preserving request fan-out
//! - [`polyline`] - codec for the service's delta-encoded geometries
//! - [`merge`] - per-chunk result reassembly
//!
//! ## Quick Start
//!
//! ```no_run
//! use map_matcher::{match_trace, Feature, FeatureCollection, MatchOptions, Profile};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let trace = FeatureCollection::new(vec![Feature::line_string(
//!         vec![[-0.1278, 51.5074], [-0.1290, 51.5080], [-0.1300, 51.5090]],
//!         json!({ "coordTimes": [0, 5, 10] }),
//!     )]);
//!
//!     let options = MatchOptions {
//!         profile: Some(Profile::Driving),
//!         access_token: "pk.your-token".to_string(),
//!         ..MatchOptions::default()
//!     };
//!
//!     let outcome = match_trace(&trace, &options).await;
//!     if let Some(error) = &outcome.error {
//!         eprintln!("matching incomplete: {error}");
//!     }
//!     if let Some(result) = outcome.result {
//!         println!("matched: {result:?}");
//!     }
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub mod dispatch;
pub mod merge;
pub mod polyline;
pub mod simplify;

pub use dispatch::{DispatchOutcome, HttpService, MatchingService};
pub use polyline::DecodeError;
pub use simplify::{DEFAULT_MAXIMUM_POINTS, DEFAULT_MINIMUM_DISTANCE, DEFAULT_MINIMUM_TIME};

/// Decode precision used when the caller does not set `gps_precision`.
/// The Mapbox matching service emits polylines at precision 6.
pub const DEFAULT_GPS_PRECISION: u32 = 6;

// ============================================================================
// Errors
// ============================================================================

/// Everything that can go wrong while matching a trace.
#[derive(Debug, Clone, Error)]
pub enum MatchError {
    /// Bad or missing profile/endpoint, or an unusable option combination.
    /// Always raised before any request is sent.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The trace holds too few points after filtering; matching needs at
    /// least two.
    #[error("trace has {found} point(s) after filtering, matching needs at least 2")]
    InsufficientPoints { found: usize },

    /// A response carried a malformed polyline geometry.
    #[error("polyline decode failed: {0}")]
    Decode(#[from] DecodeError),

    /// A response did not hold exactly one matched feature for its chunk.
    #[error("chunk {index}: expected exactly 1 matched feature, got {count}")]
    MergeShape { index: usize, count: usize },

    /// A single request against the matching service failed.
    #[error("request {index} failed: {message}")]
    Network { index: usize, message: String },
}

// ============================================================================
// Data model
// ============================================================================

/// One observed GPS fix: (lon, lat) plus an optional epoch-seconds timestamp
/// recovered from the feature's `coordTimes` property.
#[derive(Debug, Clone, PartialEq)]
pub struct TracePoint {
    pub longitude: f64,
    pub latitude: f64,
    pub time: Option<f64>,
}

/// GeoJSON LineString geometry. Coordinates are (lon, lat).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineStringGeometry {
    #[serde(rename = "type")]
    pub geometry_type: String,
    pub coordinates: Vec<[f64; 2]>,
}

/// GeoJSON Feature with a LineString geometry. Properties are carried
/// through the pipeline untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type")]
    pub feature_type: String,
    #[serde(default)]
    pub properties: Value,
    pub geometry: LineStringGeometry,
}

impl Feature {
    /// Build a LineString feature from (lon, lat) coordinates.
    pub fn line_string(coordinates: Vec<[f64; 2]>, properties: Value) -> Self {
        Self {
            feature_type: "Feature".to_string(),
            properties,
            geometry: LineStringGeometry {
                geometry_type: "LineString".to_string(),
                coordinates,
            },
        }
    }

    /// Expand the geometry into trace points, pairing each coordinate with
    /// its `coordTimes` entry when present. Entries may be epoch seconds or
    /// RFC 3339 strings.
    pub fn trace_points(&self) -> Vec<TracePoint> {
        let times = self.properties.get("coordTimes").and_then(Value::as_array);

        self.geometry
            .coordinates
            .iter()
            .enumerate()
            .map(|(i, coordinate)| TracePoint {
                longitude: coordinate[0],
                latitude: coordinate[1],
                time: times
                    .and_then(|entries| entries.get(i))
                    .and_then(parse_coord_time),
            })
            .collect()
    }
}

/// GeoJSON FeatureCollection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    pub collection_type: String,
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn new(features: Vec<Feature>) -> Self {
        Self {
            collection_type: "FeatureCollection".to_string(),
            features,
        }
    }
}

fn parse_coord_time(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.timestamp_millis() as f64 / 1000.0),
        _ => None,
    }
}

/// A size-bounded contiguous slice of a filtered trace. The index is the
/// sole correlation key between a request and its slot in the results.
#[derive(Debug, Clone)]
pub struct SubTrace {
    pub index: usize,
    pub points: Vec<TracePoint>,
    pub properties: Value,
}

impl SubTrace {
    /// Render the sub-trace as the GeoJSON Feature the service expects.
    pub fn to_feature(&self) -> Feature {
        let coordinates = self
            .points
            .iter()
            .map(|p| [p.longitude, p.latitude])
            .collect();
        Feature::line_string(coordinates, self.properties.clone())
    }
}

/// One immutable outbound request: the resolved URL plus the serialized
/// Feature body.
#[derive(Debug, Clone)]
pub struct MatchRequest {
    pub index: usize,
    pub url: String,
    pub body: String,
}

/// Decoded matched geometry for one chunk, coordinates already in
/// (lon, lat) order.
#[derive(Debug, Clone)]
pub struct MatchResponse {
    pub index: usize,
    pub features: FeatureCollection,
}

// ============================================================================
// Configuration
// ============================================================================

/// Routing profile understood by the canonical matching endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Driving,
    Walking,
    Cycling,
}

impl Profile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Driving => "driving",
            Profile::Walking => "walking",
            Profile::Cycling => "cycling",
        }
    }
}

/// What [`match_trace`] should hand back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Output {
    /// The raw merged feature collection.
    #[default]
    Geojson,
    /// A feature-layer handle for a rendering collaborator.
    Layer,
}

/// Options for one matching run. The access token is threaded through
/// explicitly; there is no ambient credential state.
#[derive(Debug, Clone)]
pub struct MatchOptions {
    /// Routing profile; resolves to a canonical endpoint.
    pub profile: Option<Profile>,
    /// Explicit endpoint override; bypasses the profile mapping.
    pub map_match_api: Option<String>,
    /// Access token appended to every request URL.
    pub access_token: String,
    /// Minimum distance between kept points, meters.
    pub minimum_distance: f64,
    /// Minimum time between kept points, seconds.
    pub minimum_time: f64,
    /// Maximum points per sub-trace request.
    pub maximum_points: usize,
    /// Forwarded as the `gps_precision` query parameter and used to decode
    /// response geometries. Defaults to the service's precision of 6.
    pub gps_precision: Option<u32>,
    /// Output mode.
    pub output: Output,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            profile: None,
            map_match_api: None,
            access_token: String::new(),
            minimum_distance: DEFAULT_MINIMUM_DISTANCE,
            minimum_time: DEFAULT_MINIMUM_TIME,
            maximum_points: DEFAULT_MAXIMUM_POINTS,
            gps_precision: None,
            output: Output::Geojson,
        }
    }
}

impl MatchOptions {
    /// Resolve the endpoint: an explicit override wins, otherwise a known
    /// profile maps to its canonical endpoint.
    pub fn resolve_endpoint(&self) -> Result<String, MatchError> {
        if let Some(endpoint) = &self.map_match_api {
            return Ok(endpoint.clone());
        }
        match self.profile {
            Some(profile) => Ok(format!(
                "https://api.tiles.mapbox.com/matching/v4/mapbox.{}.json",
                profile.as_str()
            )),
            None => Err(MatchError::Configuration(
                "need either a map_match_api endpoint or a profile of \
                 driving, walking, cycling"
                    .to_string(),
            )),
        }
    }

    /// Precision used to decode response polylines.
    pub fn decode_precision(&self) -> u32 {
        self.gps_precision.unwrap_or(DEFAULT_GPS_PRECISION)
    }
}

// ============================================================================
// Entry point
// ============================================================================

/// Handle for a rendering collaborator; wraps the merged collection when
/// [`Output::Layer`] is requested. Rendering itself happens elsewhere.
#[derive(Debug, Clone)]
pub struct FeatureLayer {
    pub collection: FeatureCollection,
}

/// Result payload of a matching run.
#[derive(Debug, Clone)]
pub enum MatchOutput {
    Geojson(FeatureCollection),
    Layer(FeatureLayer),
}

/// Final outcome of a matching run.
///
/// `error` and `result` can both be set: when some chunks fail, the merged
/// output covers the successful chunks only and `error` carries the first
/// failure. A non-`None` error always means the result is incomplete.
#[derive(Debug)]
pub struct MatchOutcome {
    pub result: Option<MatchOutput>,
    pub error: Option<MatchError>,
}

impl MatchOutcome {
    fn failed(error: MatchError) -> Self {
        Self {
            result: None,
            error: Some(error),
        }
    }
}

/// Match a trace against the remote service over HTTP.
///
/// Simplifies the trace, fans the chunks out concurrently, decodes every
/// response, and merges the chunks back together in original order.
pub async fn match_trace(trace: &FeatureCollection, options: &MatchOptions) -> MatchOutcome {
    let service = match HttpService::new() {
        Ok(service) => service,
        Err(error) => return MatchOutcome::failed(error),
    };
    match_trace_with(&service, trace, options).await
}

/// [`match_trace`] against any [`MatchingService`] implementation.
pub async fn match_trace_with<S: MatchingService + Sync>(
    service: &S,
    trace: &FeatureCollection,
    options: &MatchOptions,
) -> MatchOutcome {
    // Configuration problems surface before anything is dispatched.
    if let Err(error) = options.resolve_endpoint() {
        return MatchOutcome::failed(error);
    }

    let subtraces = match simplify::split(trace, options) {
        Ok(subtraces) => subtraces,
        Err(error) => return MatchOutcome::failed(error),
    };
    let requests = match dispatch::build_requests(&subtraces, options) {
        Ok(requests) => requests,
        Err(error) => return MatchOutcome::failed(error),
    };

    let DispatchOutcome {
        results,
        first_error,
    } = dispatch::dispatch(service, &requests, options.decode_precision()).await;

    // Merge whatever succeeded, in index order. Chunks lost to failed
    // requests leave the output partial; first_error tells the caller so.
    let responses: Vec<MatchResponse> = results.into_iter().flatten().collect();
    if responses.is_empty() {
        // Every chunk failed; an empty collection would masquerade as a
        // legitimate zero-feature result.
        if let Some(error) = first_error {
            return MatchOutcome::failed(error);
        }
    }
    let merged = match merge::merge(&responses) {
        Ok(merged) => merged,
        Err(error) => return MatchOutcome::failed(first_error.unwrap_or(error)),
    };

    let result = match options.output {
        Output::Geojson => MatchOutput::Geojson(merged),
        Output::Layer => MatchOutput::Layer(FeatureLayer { collection: merged }),
    };
    MatchOutcome {
        result: Some(result),
        error: first_error,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fake service that counts calls and answers every chunk with the same
    /// single-feature matched geometry.
    struct CountingService {
        calls: AtomicUsize,
        failing_index: Option<usize>,
    }

    impl CountingService {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failing_index: None,
            }
        }

        fn failing_at(index: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failing_index: Some(index),
            }
        }
    }

    impl MatchingService for CountingService {
        async fn call(&self, request: &MatchRequest) -> Result<String, MatchError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.failing_index == Some(request.index) {
                return Err(MatchError::Network {
                    index: request.index,
                    message: "simulated outage".to_string(),
                });
            }

            let matched = vec![[-0.1278, 51.5074], [-0.1290, 51.5080], [-0.1301, 51.5091]];
            Ok(json!({
                "features": [{
                    "properties": { "chunk": request.index },
                    "geometry": polyline::encode(&matched, 6),
                }]
            })
            .to_string())
        }
    }

    /// A 150-point trace with ~5m / 1s spacing.
    fn dense_trace() -> FeatureCollection {
        let coordinates: Vec<[f64; 2]> = (0..150)
            .map(|i| [-0.1278, 51.5074 + i as f64 * 0.000045])
            .collect();
        let times: Vec<u64> = (0..150u64).collect();
        FeatureCollection::new(vec![Feature::line_string(
            coordinates,
            json!({ "coordTimes": times }),
        )])
    }

    fn token_options() -> MatchOptions {
        MatchOptions {
            profile: Some(Profile::Driving),
            access_token: "pk.test".to_string(),
            ..MatchOptions::default()
        }
    }

    #[tokio::test]
    async fn test_end_to_end_single_chunk() {
        let service = CountingService::new();
        let outcome = match_trace_with(&service, &dense_trace(), &token_options()).await;

        assert!(outcome.error.is_none());
        // 150 points at 5m/1s filter down to ~75, well under one chunk.
        assert_eq!(service.calls.load(Ordering::Relaxed), 1);

        let Some(MatchOutput::Geojson(merged)) = outcome.result else {
            panic!("expected geojson output");
        };
        assert_eq!(merged.features.len(), 1);
        let coords = &merged.features[0].geometry.coordinates;
        // (lon, lat) order: London longitude is negative, latitude ~51.5.
        assert!(coords[0][0] < 0.0);
        assert!((coords[0][1] - 51.5074).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_missing_profile_and_endpoint_fails_before_dispatch() {
        let service = CountingService::new();
        let trace = dense_trace();
        let options = MatchOptions {
            access_token: "pk.test".to_string(),
            ..MatchOptions::default()
        };

        let outcome = match_trace_with(&service, &trace, &options).await;

        assert!(outcome.result.is_none());
        assert!(matches!(outcome.error, Some(MatchError::Configuration(_))));
        assert_eq!(service.calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_partial_failure_reports_error_with_partial_result() {
        let service = CountingService::failing_at(1);
        let coordinates: Vec<[f64; 2]> = (0..250)
            .map(|i| [-0.1278 + i as f64 * 0.001, 51.5074])
            .collect();
        let trace = FeatureCollection::new(vec![Feature::line_string(coordinates, json!({}))]);
        let options = MatchOptions {
            minimum_distance: 0.0,
            minimum_time: 0.0,
            ..token_options()
        };

        let outcome = match_trace_with(&service, &trace, &options).await;

        // 250 points -> 3 chunks; chunk 1 fails, the others still complete.
        assert_eq!(service.calls.load(Ordering::Relaxed), 3);
        assert!(matches!(
            outcome.error,
            Some(MatchError::Network { index: 1, .. })
        ));
        let Some(MatchOutput::Geojson(merged)) = outcome.result else {
            panic!("expected partial geojson output");
        };
        assert_eq!(merged.features.len(), 2);
    }

    #[tokio::test]
    async fn test_total_failure_yields_no_result() {
        // The single chunk fails, so there is nothing partial to hand back.
        let service = CountingService::failing_at(0);
        let outcome = match_trace_with(&service, &dense_trace(), &token_options()).await;

        assert_eq!(service.calls.load(Ordering::Relaxed), 1);
        assert!(outcome.result.is_none());
        assert!(matches!(
            outcome.error,
            Some(MatchError::Network { index: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_layer_output_wraps_the_merged_collection() {
        let service = CountingService::new();
        let options = MatchOptions {
            output: Output::Layer,
            ..token_options()
        };

        let outcome = match_trace_with(&service, &dense_trace(), &options).await;

        let Some(MatchOutput::Layer(layer)) = outcome.result else {
            panic!("expected layer output");
        };
        assert_eq!(layer.collection.features.len(), 1);
    }

    #[tokio::test]
    async fn test_short_trace_is_insufficient() {
        let service = CountingService::new();
        let trace = FeatureCollection::new(vec![Feature::line_string(
            vec![[-0.1278, 51.5074]],
            json!({}),
        )]);

        let outcome = match_trace_with(&service, &trace, &token_options()).await;

        assert!(outcome.result.is_none());
        assert!(matches!(
            outcome.error,
            Some(MatchError::InsufficientPoints { found: 1 })
        ));
        assert_eq!(service.calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_trace_points_parse_rfc3339_coord_times() {
        let feature = Feature::line_string(
            vec![[-0.1278, 51.5074], [-0.1290, 51.5080]],
            json!({ "coordTimes": ["2015-03-01T12:00:00Z", "2015-03-01T12:00:05Z"] }),
        );
        let points = feature.trace_points();

        assert_eq!(points.len(), 2);
        let t0 = points[0].time.unwrap();
        let t1 = points[1].time.unwrap();
        assert!((t1 - t0 - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_trace_points_accept_numeric_coord_times() {
        let feature = Feature::line_string(
            vec![[-0.1278, 51.5074], [-0.1290, 51.5080]],
            json!({ "coordTimes": [100, 107.5] }),
        );
        let points = feature.trace_points();
        assert_eq!(points[1].time, Some(107.5));
    }

    #[test]
    fn test_endpoint_resolution() {
        let mut options = token_options();
        assert_eq!(
            options.resolve_endpoint().unwrap(),
            "https://api.tiles.mapbox.com/matching/v4/mapbox.driving.json"
        );

        options.map_match_api = Some("https://matcher.example/v4.json".to_string());
        assert_eq!(
            options.resolve_endpoint().unwrap(),
            "https://matcher.example/v4.json"
        );
    }
}
