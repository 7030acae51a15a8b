//! Variant ranking for storefront search results.
//!
//! Each candidate gets a score built from name similarity (the baseline),
//! purchase-history matches, pack-size proximity to the household's usual
//! quantity, price (normalized across the candidate set), active offers, and
//! a small preference for earlier result positions. Unavailable items never
//! reach scoring.

use super::driver::ProductCandidate;

/// Similarity floor under which a candidate is considered a different
/// product entirely.
pub const SIMILARITY_FLOOR: f64 = 0.3;

const HISTORY_BONUS: f64 = 0.5;
const PACK_PROXIMITY_WEIGHT: f64 = 0.3;
const PRICE_WEIGHT: f64 = 0.2;
const OFFER_BONUS: f64 = 0.1;
const POSITION_WEIGHT: f64 = 0.1;

/// What the ranker knows about the user beyond the query itself.
#[derive(Debug, Clone, Default)]
pub struct RankingContext {
  /// Product names from past orders; exact (case-insensitive) matches get a
  /// strong boost.
  pub purchase_history: Vec<String>,
  /// Average pack size the household consumes, in the item's unit.
  pub avg_consumption_size: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ScoredCandidate {
  pub candidate: ProductCandidate,
  pub score: f64,
  pub similarity: f64,
}

/// Token-set Dice similarity; order-insensitive, case-insensitive.
pub fn name_similarity(a: &str, b: &str) -> f64 {
  let ta = tokens(a);
  let tb = tokens(b);
  if ta.is_empty() || tb.is_empty() {
    return 0.0;
  }
  let shared = ta.iter().filter(|t| tb.contains(*t)).count();
  (2.0 * shared as f64) / (ta.len() + tb.len()) as f64
}

fn tokens(s: &str) -> Vec<String> {
  let mut tokens: Vec<String> = s
    .to_lowercase()
    .split(|c: char| !c.is_alphanumeric())
    .filter(|t| !t.is_empty())
    .map(str::to_string)
    .collect();
  tokens.sort();
  tokens.dedup();
  tokens
}

/// Filter out unavailable candidates, score the rest, and return them in
/// descending score order.
pub fn rank_candidates(
  query: &str,
  candidates: Vec<ProductCandidate>,
  ctx: &RankingContext,
) -> Vec<ScoredCandidate> {
  let available: Vec<ProductCandidate> =
    candidates.into_iter().filter(|c| c.available).collect();
  if available.is_empty() {
    return Vec::new();
  }

  let max_price = available
    .iter()
    .map(|c| c.price)
    .fold(f64::MIN, f64::max)
    .max(f64::EPSILON);
  let min_price = available.iter().map(|c| c.price).fold(f64::MAX, f64::min);
  let price_span = (max_price - min_price).max(f64::EPSILON);
  let result_count = available.len();

  let mut scored: Vec<ScoredCandidate> = available
    .into_iter()
    .map(|candidate| {
      let similarity = name_similarity(query, &candidate.name);
      let mut score = similarity;

      if ctx
        .purchase_history
        .iter()
        .any(|h| h.eq_ignore_ascii_case(&candidate.name))
      {
        score += HISTORY_BONUS;
      }

      if let (Some(avg), Some(pack)) = (ctx.avg_consumption_size, candidate.pack_size) {
        if avg > 0.0 {
          let proximity = 1.0 - ((pack - avg).abs() / avg).min(1.0);
          score += PACK_PROXIMITY_WEIGHT * proximity;
        }
      }

      // Cheaper is better, scaled within this result set.
      let price_norm = 1.0 - ((candidate.price - min_price) / price_span);
      score += PRICE_WEIGHT * price_norm;

      if candidate.has_offer {
        score += OFFER_BONUS;
      }

      let position_pref = 1.0 - (candidate.position as f64 / result_count as f64);
      score += POSITION_WEIGHT * position_pref.clamp(0.0, 1.0);

      ScoredCandidate {
        similarity,
        score,
        candidate,
      }
    })
    .collect();

  scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
  scored
}
