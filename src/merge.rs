//! Reassembly of per-chunk matched geometries into one feature collection.
//!
//! The matching service is expected, but not guaranteed, to return exactly
//! one matched LineString per submitted chunk. That expectation is checked
//! here: a response with zero or several features is rejected instead of
//! silently truncated, so the merged collection always has one feature per
//! sub-trace, in original chunk order.

use log::debug;

use crate::{FeatureCollection, MatchError, MatchResponse};

/// Concatenate ordered per-chunk responses into a single collection.
///
/// Callers pass responses already sorted by sub-trace index. Fails with
/// [`MatchError::MergeShape`] when any response does not hold exactly one
/// feature.
pub fn merge(responses: &[MatchResponse]) -> Result<FeatureCollection, MatchError> {
    let mut features = Vec::with_capacity(responses.len());

    for response in responses {
        match response.features.features.as_slice() {
            [feature] => features.push(feature.clone()),
            other => {
                return Err(MatchError::MergeShape {
                    index: response.index,
                    count: other.len(),
                })
            }
        }
    }

    debug!("merged {} chunk(s)", features.len());
    Ok(FeatureCollection::new(features))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Feature;
    use serde_json::json;

    fn response(index: usize, feature_count: usize) -> MatchResponse {
        let features = (0..feature_count)
            .map(|i| {
                Feature::line_string(
                    vec![[index as f64, i as f64], [index as f64 + 0.001, i as f64]],
                    json!({ "chunk": index }),
                )
            })
            .collect();
        MatchResponse {
            index,
            features: FeatureCollection::new(features),
        }
    }

    #[test]
    fn test_merged_feature_count_equals_chunk_count() {
        let responses = vec![response(0, 1), response(1, 1), response(2, 1)];
        let merged = merge(&responses).unwrap();

        assert_eq!(merged.features.len(), 3);
        for (index, feature) in merged.features.iter().enumerate() {
            assert_eq!(feature.properties["chunk"], index);
        }
    }

    #[test]
    fn test_empty_response_is_a_shape_error() {
        let responses = vec![response(0, 1), response(1, 0)];
        let err = merge(&responses).unwrap_err();
        assert!(matches!(err, MatchError::MergeShape { index: 1, count: 0 }));
    }

    #[test]
    fn test_multi_feature_response_is_a_shape_error() {
        let responses = vec![response(0, 2)];
        let err = merge(&responses).unwrap_err();
        assert!(matches!(err, MatchError::MergeShape { index: 0, count: 2 }));
    }

    #[test]
    fn test_merge_nothing_is_empty() {
        assert_eq!(merge(&[]).unwrap().features.len(), 0);
    }
}
