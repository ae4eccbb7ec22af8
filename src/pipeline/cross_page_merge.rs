//! `cross_page_merge`: merge `ScoringPointResult`s for the same point across
//! the pages of one grading unit. A point whose rubric marks it "met once"
//! keeps its single highest-confidence award; a "cumulative" point sums
//! non-overlapping evidence across pages, bounded by the point's own score.

use std::collections::HashMap;

use crate::run::{AccumulationMode, ScoringPointResult};

pub fn merge_points(
    results: Vec<ScoringPointResult>,
    mode_for_point: impl Fn(&str) -> AccumulationMode,
    point_caps: impl Fn(&str) -> f64,
) -> Vec<ScoringPointResult> {
    let mut grouped: HashMap<String, Vec<ScoringPointResult>> = HashMap::new();
    for result in results {
        grouped.entry(result.point_id.clone()).or_default().push(result);
    }

    let mut merged = Vec::with_capacity(grouped.len());
    for (point_id, mut group) in grouped {
        match mode_for_point(&point_id) {
            AccumulationMode::MetOnce => {
                group.sort_by(|a, b| {
                    b.confidence
                        .partial_cmp(&a.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.page_index.cmp(&b.page_index))
                });
                merged.push(group.into_iter().next().expect("non-empty group"));
            }
            AccumulationMode::Cumulative => {
                group.sort_by_key(|r| r.page_index);
                let cap = point_caps(&point_id);
                let mut best = group.remove(0);
                let mut total_awarded = best.awarded;
                for next in group {
                    total_awarded = (total_awarded + next.awarded).min(cap);
                    if next.confidence > best.confidence {
                        best.evidence = next.evidence;
                        best.rubric_reference = next.rubric_reference;
                        best.citation_quality = next.citation_quality;
                        best.confidence = next.confidence;
                        best.page_index = next.page_index;
                    }
                }
                best.awarded = total_awarded;
                merged.push(best);
            }
        }
    }
    merged.sort_by(|a, b| a.point_id.cmp(&b.point_id));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::CitationQuality;

    fn point(point_id: &str, awarded: f64, confidence: f64, page_index: u32) -> ScoringPointResult {
        ScoringPointResult {
            point_id: point_id.into(),
            awarded,
            evidence: format!("page {page_index}"),
            rubric_reference: point_id.into(),
            rubric_text: String::new(),
            citation_quality: CitationQuality::High,
            is_alternative_solution: false,
            confidence,
            page_index,
        }
    }

    #[test]
    fn met_once_keeps_the_highest_confidence_award() {
        let results = vec![point("1.1", 3.0, 0.6, 0), point("1.1", 5.0, 0.9, 1)];
        let merged = merge_points(results, |_| AccumulationMode::MetOnce, |_| 5.0);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].awarded, 5.0);
        assert_eq!(merged[0].page_index, 1);
    }

    #[test]
    fn cumulative_sums_across_pages_bounded_by_cap() {
        let results = vec![point("2.1", 4.0, 0.8, 0), point("2.1", 4.0, 0.7, 1)];
        let merged = merge_points(results, |_| AccumulationMode::Cumulative, |_| 6.0);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].awarded, 6.0);
    }

    #[test]
    fn distinct_points_are_merged_independently() {
        let results = vec![point("1.1", 3.0, 0.9, 0), point("2.1", 2.0, 0.9, 0)];
        let merged = merge_points(results, |_| AccumulationMode::MetOnce, |_| 5.0);
        assert_eq!(merged.len(), 2);
    }
}
