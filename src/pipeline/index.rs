//! `index`: detect student boundaries. For each page, a header probe
//! describes the top of the page (name, date, class); a rolling detector
//! groups consecutive pages sharing a student signature; low-confidence
//! gap pages are marked `unidentified`. The partition is stable under
//! re-running with the same inputs, since the detector is a pure fold over
//! the probe sequence.

use serde_json::json;

use crate::events::{EventLog, EventType};
use crate::run::{StudentBoundary, UNIDENTIFIED};

use super::PageImage;

/// Result of probing one page's header region. In the full system this
/// probe is itself a gateway call (`kind=page_describe`); it is injected
/// here as a plain function of a `PageImage` so `index`'s grouping logic
/// stays a pure, independently testable fold.
#[derive(Debug, Clone)]
pub struct HeaderProbe {
    pub student_key: Option<String>,
    pub class_id: Option<String>,
    pub confidence: f64,
}

pub const HEADER_CONFIDENCE_THRESHOLD: f64 = 0.5;

pub fn index(pages: &[PageImage], probe: impl Fn(&PageImage) -> HeaderProbe, events: &EventLog) -> Vec<StudentBoundary> {
    let mut boundaries: Vec<StudentBoundary> = Vec::new();
    let mut current: Option<(String, Option<String>, u32, u32, f64)> = None;

    let flush = |current: Option<(String, Option<String>, u32, u32, f64)>, boundaries: &mut Vec<StudentBoundary>| {
        if let Some((student_key, class_id, start, end, confidence)) = current {
            boundaries.push(StudentBoundary {
                student_key,
                start_page: start,
                end_page: end,
                class_id,
                confidence,
            });
        }
    };

    for page in pages {
        let result = probe(page);
        let low_confidence = result.confidence < HEADER_CONFIDENCE_THRESHOLD || result.student_key.is_none();

        if low_confidence {
            flush(current.take(), &mut boundaries);
            extend_unidentified(&mut boundaries, page.page_index);
            continue;
        }

        let student_key = result.student_key.unwrap();
        match &mut current {
            Some((key, _, _, end, confidence)) if *key == student_key => {
                *end = page.page_index;
                *confidence = confidence.min(result.confidence);
            }
            _ => {
                flush(current.take(), &mut boundaries);
                current = Some((student_key, result.class_id, page.page_index, page.page_index, result.confidence));
            }
        }
    }
    flush(current, &mut boundaries);

    events.emit(
        EventType::IndexCompleted,
        json!({ "boundaries": boundaries.len() }),
    );

    boundaries
}

fn extend_unidentified(boundaries: &mut Vec<StudentBoundary>, page_index: u32) {
    if let Some(last) = boundaries.last_mut() {
        if last.student_key == UNIDENTIFIED && last.end_page + 1 == page_index {
            last.end_page = page_index;
            return;
        }
    }
    boundaries.push(StudentBoundary {
        student_key: UNIDENTIFIED.to_string(),
        start_page: page_index,
        end_page: page_index,
        class_id: None,
        confidence: 0.0,
    });
}
