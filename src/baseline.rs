//! Sentinel-2 products are reprocessed under newer processing baselines, so one
//! acquisition can show up several times. Keep only the latest processing.
use std::collections::HashMap;

use crate::feature::Feature;

/// Baselines from here up are reserved values, never a real reprocessing.
pub const RESERVED_BASELINE: f64 = 9900.0;

fn acquisition_key(feature: &Feature) -> Option<&str> {
    let start = feature.properties.start_date.as_deref()?;
    Some(start.split('.').next().unwrap_or(start))
}

/// Among features sharing an acquisition start time (fractional seconds ignored),
/// keeps those with the highest baseline below [`RESERVED_BASELINE`]. Features alone
/// in their group, or without a start time, are kept as they are. Input order is
/// preserved.
pub fn select_latest_baseline(features: Vec<Feature>) -> Vec<Feature> {
    let keep = latest_mask(&features);
    features
        .into_iter()
        .zip(keep)
        .filter_map(|(feature, keep)| keep.then_some(feature))
        .collect()
}

fn latest_mask(features: &[Feature]) -> Vec<bool> {
    let mut groups: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, feature) in features.iter().enumerate() {
        if let Some(key) = acquisition_key(feature) {
            groups.entry(key).or_default().push(i);
        }
    }

    let mut keep = vec![true; features.len()];
    for members in groups.values().filter(|m| m.len() > 1) {
        let baselines: Vec<Option<f64>> = members
            .iter()
            .map(|&i| features[i].processing_baseline())
            .collect();
        let best = baselines
            .iter()
            .flatten()
            .copied()
            .filter(|b| *b < RESERVED_BASELINE)
            .fold(None, |best: Option<f64>, b| Some(best.map_or(b, |x| x.max(b))));
        for (&i, baseline) in members.iter().zip(&baselines) {
            keep[i] = best.is_some() && *baseline == best;
        }
    }
    keep
}
