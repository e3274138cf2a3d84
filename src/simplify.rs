//! Trace simplification: noise filtering and API-sized chunking.
//!
//! This is a noise-reduction pass, not a geometric simplification: a point
//! is dropped only when it is both too close to the last kept point and too
//! soon after it. Points without timestamps are filtered on distance alone.
//!
//! After filtering, traces longer than the service's per-request point limit
//! are split into consecutive chunks. Chunks do not overlap, so minor seam
//! artifacts at chunk boundaries are accepted.

use geo::{Distance, Haversine, Point};
use log::debug;

use crate::{FeatureCollection, MatchError, MatchOptions, SubTrace, TracePoint};

/// Default minimum distance between kept points, in meters.
pub const DEFAULT_MINIMUM_DISTANCE: f64 = 10.0;
/// Default minimum time between kept points, in seconds.
pub const DEFAULT_MINIMUM_TIME: f64 = 5.0;
/// Default maximum points per sub-trace request.
pub const DEFAULT_MAXIMUM_POINTS: usize = 100;

/// Great-circle distance between two trace points in meters.
#[inline]
pub fn haversine_distance(a: &TracePoint, b: &TracePoint) -> f64 {
    let p1 = Point::new(a.longitude, a.latitude);
    let p2 = Point::new(b.longitude, b.latitude);
    Haversine::distance(p1, p2)
}

/// Filter a trace down to points that are far enough apart or old enough.
///
/// The first point is always kept. Every later point is dropped only when
/// its distance to the last *kept* point is below `minimum_distance` AND its
/// time delta to that point is below `minimum_time`. A missing timestamp on
/// either side counts as a zero time delta, so the distance criterion alone
/// decides.
pub fn tidy(points: &[TracePoint], minimum_distance: f64, minimum_time: f64) -> Vec<TracePoint> {
    let mut kept: Vec<TracePoint> = Vec::with_capacity(points.len());

    for point in points {
        let Some(last) = kept.last() else {
            kept.push(point.clone());
            continue;
        };

        let distance = haversine_distance(last, point);
        let elapsed = match (last.time, point.time) {
            (Some(earlier), Some(later)) => later - earlier,
            _ => 0.0,
        };

        if distance < minimum_distance && elapsed < minimum_time {
            continue;
        }
        kept.push(point.clone());
    }

    debug!("tidy kept {}/{} points", kept.len(), points.len());
    kept
}

/// Split a filtered trace into consecutive chunks of at most
/// `maximum_points` points, never fewer than 2.
///
/// The chunk count is `ceil(N / maximum_points)` and concatenating the
/// chunks in order reproduces the input exactly. When the final chunk would
/// be left with a single point, the previous boundary shifts back by one.
///
/// Fails with [`MatchError::InsufficientPoints`] when the trace holds fewer
/// than 2 points, and with [`MatchError::Configuration`] when
/// `maximum_points` cannot yield chunks of at least 2 (only possible for
/// `maximum_points < 3` on awkward lengths).
pub fn chunk(
    points: &[TracePoint],
    maximum_points: usize,
) -> Result<Vec<Vec<TracePoint>>, MatchError> {
    let total = points.len();
    if total < 2 {
        return Err(MatchError::InsufficientPoints { found: total });
    }
    if maximum_points < 2 {
        return Err(MatchError::Configuration(format!(
            "maximum_points must be at least 2, got {maximum_points}"
        )));
    }

    let mut chunks = Vec::with_capacity(total.div_ceil(maximum_points));
    let mut start = 0;
    while start < total {
        let mut end = (start + maximum_points).min(total);
        // A trailing chunk of one point cannot be matched; donate a point.
        if end < total && total - end == 1 {
            end -= 1;
        }
        if end - start < 2 {
            return Err(MatchError::Configuration(format!(
                "cannot split {total} points into chunks of at most {maximum_points} \
                 with at least 2 points each"
            )));
        }
        chunks.push(points[start..end].to_vec());
        start = end;
    }

    Ok(chunks)
}

/// Simplify every LineString feature of a trace and flatten the chunks into
/// an ordered list of sub-traces.
///
/// Sub-trace indices run over the concatenation of all features' chunks;
/// each sub-trace carries its source feature's properties. Non-LineString
/// features are skipped.
pub fn split(trace: &FeatureCollection, options: &MatchOptions) -> Result<Vec<SubTrace>, MatchError> {
    let mut subtraces = Vec::new();

    for feature in &trace.features {
        if feature.geometry.geometry_type != "LineString" {
            debug!("skipping non-LineString feature ({})", feature.geometry.geometry_type);
            continue;
        }

        let points = feature.trace_points();
        let kept = tidy(&points, options.minimum_distance, options.minimum_time);
        if kept.len() < 2 {
            return Err(MatchError::InsufficientPoints { found: kept.len() });
        }

        for piece in chunk(&kept, options.maximum_points)? {
            subtraces.push(SubTrace {
                index: subtraces.len(),
                points: piece,
                properties: feature.properties.clone(),
            });
        }
    }

    if subtraces.is_empty() {
        return Err(MatchError::InsufficientPoints { found: 0 });
    }

    Ok(subtraces)
}
