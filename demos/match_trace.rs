//! End-to-end map matching of a small GPS trace.
//!
//! Run with: MAPBOX_ACCESS_TOKEN=pk.your-token cargo run --example match_trace

use map_matcher::{match_trace, Feature, FeatureCollection, MatchOptions, MatchOutput, Profile};
use serde_json::json;

#[tokio::main]
async fn main() {
    let access_token = match std::env::var("MAPBOX_ACCESS_TOKEN") {
        Ok(token) => token,
        Err(_) => {
            eprintln!("set MAPBOX_ACCESS_TOKEN to run this demo");
            return;
        }
    };

    // A short drive through central London, one fix per 5 seconds.
    let coordinates = vec![
        [-0.1278, 51.5074],
        [-0.1284, 51.5078],
        [-0.1290, 51.5080],
        [-0.1297, 51.5084],
        [-0.1305, 51.5088],
        [-0.1312, 51.5092],
    ];
    let times: Vec<u64> = (0..coordinates.len() as u64).map(|i| i * 5).collect();
    let trace = FeatureCollection::new(vec![Feature::line_string(
        coordinates,
        json!({ "coordTimes": times }),
    )]);

    let options = MatchOptions {
        profile: Some(Profile::Driving),
        access_token,
        ..MatchOptions::default()
    };

    let outcome = match_trace(&trace, &options).await;

    if let Some(error) = &outcome.error {
        eprintln!("matching incomplete: {error}");
    }

    match outcome.result {
        Some(MatchOutput::Geojson(merged)) => {
            println!("matched {} feature(s)", merged.features.len());
            for feature in &merged.features {
                println!(
                    "  {} snapped point(s), first at {:?}",
                    feature.geometry.coordinates.len(),
                    feature.geometry.coordinates.first()
                );
            }
        }
        Some(MatchOutput::Layer(layer)) => {
            println!("layer with {} feature(s)", layer.collection.features.len());
        }
        None => println!("no result"),
    }
}
