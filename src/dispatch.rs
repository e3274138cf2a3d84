//! Concurrent dispatch of sub-trace requests against the matching service.
//!
//! Every sub-trace becomes one POST of a GeoJSON Feature. All requests are
//! issued concurrently through a buffered stream; completions are written
//! back into a slot vector by request index, so result order always matches
//! sub-trace order no matter when responses arrive.
//!
//! A failing request never cancels its siblings: the batch always waits for
//! every outcome and reports the first error encountered alongside the
//! partial results. Retry policy belongs to the caller, not this layer.

use std::future::Future;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::polyline::{self, DecodeError};
use crate::{Feature, FeatureCollection, MatchError, MatchOptions, MatchRequest, MatchResponse, SubTrace};

/// Maximum in-flight requests per batch.
const MAX_CONCURRENCY: usize = 8;

/// Per-request timeout for the HTTP collaborator.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The remote matching collaborator.
///
/// Production code uses [`HttpService`]; tests substitute fakes with
/// artificial delays and failures.
pub trait MatchingService {
    /// POST one request and return the raw response body.
    fn call(&self, request: &MatchRequest) -> impl Future<Output = Result<String, MatchError>> + Send;
}

/// Outcome of dispatching a batch of sub-trace requests.
///
/// `results[i]` corresponds to the sub-trace with index `i`, independent of
/// completion order. `first_error`, when set, is the first failure in
/// completion order; callers must treat the merged output as incomplete.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub results: Vec<Result<MatchResponse, MatchError>>,
    pub first_error: Option<MatchError>,
}

/// Build one immutable request per sub-trace.
///
/// Fails with a configuration error before anything is sent when neither an
/// explicit endpoint nor a recognized profile is set.
pub fn build_requests(
    subtraces: &[SubTrace],
    options: &MatchOptions,
) -> Result<Vec<MatchRequest>, MatchError> {
    let endpoint = options.resolve_endpoint()?;

    let mut url = format!(
        "{endpoint}?access_token={}&geometry=polyline",
        options.access_token
    );
    if let Some(precision) = options.gps_precision {
        url.push_str(&format!("&gps_precision={precision}"));
    }

    subtraces
        .iter()
        .map(|subtrace| {
            let body = serde_json::to_string(&subtrace.to_feature()).map_err(|e| {
                MatchError::Configuration(format!("cannot serialize sub-trace: {e}"))
            })?;
            Ok(MatchRequest {
                index: subtrace.index,
                url: url.clone(),
                body,
            })
        })
        .collect()
}

/// Issue every request concurrently and gather all outcomes by index.
pub async fn dispatch<S: MatchingService + Sync>(
    service: &S,
    requests: &[MatchRequest],
    precision: u32,
) -> DispatchOutcome {
    let total = requests.len();
    info!(
        "dispatching {} matching request(s), max {} in flight",
        total, MAX_CONCURRENCY
    );
    let started = Instant::now();

    // Pre-sized slots, written exactly once per index on completion.
    let mut results: Vec<Result<MatchResponse, MatchError>> = (0..total)
        .map(|index| {
            Err(MatchError::Network {
                index,
                message: "request never completed".to_string(),
            })
        })
        .collect();
    let mut first_error: Option<MatchError> = None;

    let mut completions = stream::iter(requests.iter())
        .map(|request| async move {
            let index = request.index;
            let result = match_one(service, request, precision).await;
            (index, result)
        })
        .buffer_unordered(MAX_CONCURRENCY);

    while let Some((index, result)) = completions.next().await {
        match &result {
            Ok(response) => debug!(
                "request {} matched {} feature(s)",
                index,
                response.features.features.len()
            ),
            Err(err) => {
                warn!("request {index} failed: {err}");
                if first_error.is_none() {
                    first_error = Some(err.clone());
                }
            }
        }
        if let Some(slot) = results.get_mut(index) {
            *slot = result;
        }
    }

    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    info!(
        "dispatch done: {}/{} succeeded in {:.2}s",
        succeeded,
        total,
        started.elapsed().as_secs_f64()
    );

    DispatchOutcome { results, first_error }
}

async fn match_one<S: MatchingService>(
    service: &S,
    request: &MatchRequest,
    precision: u32,
) -> Result<MatchResponse, MatchError> {
    let body = service.call(request).await?;
    decode_response(request.index, &body, precision)
}

/// Wire shape of a matching service response: features whose geometry is an
/// encoded polyline string.
#[derive(Debug, Deserialize)]
struct WireResponse {
    features: Vec<WireFeature>,
}

#[derive(Debug, Deserialize)]
struct WireFeature {
    #[serde(default)]
    properties: Value,
    geometry: String,
}

/// Parse a response body and decode each feature's polyline geometry into a
/// (lon, lat) LineString, carrying the per-feature properties through.
fn decode_response(index: usize, body: &str, precision: u32) -> Result<MatchResponse, MatchError> {
    let wire: WireResponse = serde_json::from_str(body).map_err(|e| MatchError::Network {
        index,
        message: format!("unexpected response body: {e}"),
    })?;

    let features = wire
        .features
        .into_iter()
        .map(|feature| {
            let coordinates = polyline::decode(&feature.geometry, precision)?;
            Ok(Feature::line_string(coordinates, feature.properties))
        })
        .collect::<Result<Vec<Feature>, DecodeError>>()?;

    Ok(MatchResponse {
        index,
        features: FeatureCollection::new(features),
    })
}

/// Matching service backed by a pooled reqwest client.
pub struct HttpService {
    client: Client,
}

impl HttpService {
    pub fn new() -> Result<Self, MatchError> {
        let client = Client::builder()
            .pool_max_idle_per_host(MAX_CONCURRENCY)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| MatchError::Configuration(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl MatchingService for HttpService {
    async fn call(&self, request: &MatchRequest) -> Result<String, MatchError> {
        let index = request.index;

        let response = self
            .client
            .post(&request.url)
            .header("Content-Type", "application/json")
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| MatchError::Network {
                index,
                message: format!("request error: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(MatchError::Network {
                index,
                message: format!("HTTP {status}"),
            });
        }

        response.text().await.map_err(|e| MatchError::Network {
            index,
            message: format!("body download error: {e}"),
        })
    }
}
