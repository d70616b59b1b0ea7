//! Collapse raw recognition hits into a distinct, ranked photo list.

use crate::types::{MatchResult, PhotoId, RawHit, SessionId};
use std::collections::HashMap;

/// Group hits by photo, keep the best confidence per photo, and order by
/// confidence descending with photo id ascending as the tie-break.
///
/// The output is independent of the order of `raw_hits`, so results from
/// concurrently completed calls always aggregate to the same sequence.
/// Hits with a NaN confidence are dropped.
pub fn aggregate(session_id: SessionId, raw_hits: &[RawHit]) -> Vec<MatchResult> {
    let mut best: HashMap<PhotoId, f32> = HashMap::with_capacity(raw_hits.len());

    for hit in raw_hits.iter().filter(|h| !h.confidence.is_nan()) {
        best.entry(hit.photo_asset_id)
            .and_modify(|c| {
                if hit.confidence > *c {
                    *c = hit.confidence;
                }
            })
            .or_insert(hit.confidence);
    }

    let mut ranked: Vec<(PhotoId, f32)> = best.into_iter().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

    ranked
        .into_iter()
        .enumerate()
        .map(|(i, (photo_asset_id, confidence))| MatchResult {
            search_session_id: session_id,
            photo_asset_id,
            confidence,
            rank: i + 1,
        })
        .collect()
}
