use std::cmp::Ordering;

use crate::domain::event::EventId;
use crate::domain::record::SimilarityHit;

/// Cosine similarity accumulated in f64. `None` on length mismatch or a zero vector.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let x64 = f64::from(x);
        let y64 = f64::from(y);
        dot += x64 * y64;
        norm_a += x64 * x64;
        norm_b += y64 * y64;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom <= f64::EPSILON {
        return None;
    }
    Some((dot / denom) as f32)
}

/// Scores every candidate and keeps the best `top_k`, strictly descending by score.
/// Equal scores are broken by event id so the order is total.
pub fn top_k<I>(query: &[f32], candidates: I, top_k: usize) -> Vec<SimilarityHit>
where
    I: IntoIterator<Item = (EventId, Vec<f32>)>,
{
    let mut hits: Vec<SimilarityHit> = candidates
        .into_iter()
        .filter_map(|(event_id, embedding)| {
            cosine_similarity(query, &embedding)
                .filter(|score| score.is_finite())
                .map(|score| SimilarityHit { event_id, score })
        })
        .collect();
    hits.sort_by(|left, right| {
        right
            .score
            .partial_cmp(&left.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| left.event_id.cmp(&right.event_id))
    });
    hits.truncate(top_k);
    hits
}

pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| f64::from(*v) * f64::from(*v)).sum::<f64>().sqrt();
    if norm > f64::EPSILON {
        for value in vector.iter_mut() {
            *value = (f64::from(*value) / norm) as f32;
        }
    }
}
