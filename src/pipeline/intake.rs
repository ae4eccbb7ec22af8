//! `intake`: validate uploaded files are non-empty, of a supported kind,
//! and within the size limit; truncate over-long PDFs with a warning event
//! rather than rejecting them outright.

use serde_json::json;

use crate::error::{Error, Result};
use crate::events::{EventLog, EventType};

use super::{FileKind, UploadedFile, MAX_FILE_BYTES, MAX_PDF_PAGES};

#[derive(Debug, Clone)]
pub struct IntakeResult {
    pub accepted: Vec<UploadedFile>,
    pub truncated_pdf_pages: Vec<(String, u32)>,
}

/// `pdf_page_count` is injected so `intake` stays a pure function over its
/// inputs: PDF page counting (and later rasterization in `preprocess`) is
/// treated as an external pure-transform boundary, per the design notes.
pub fn intake(files: Vec<UploadedFile>, pdf_page_count: impl Fn(&[u8]) -> u32, events: &EventLog) -> Result<IntakeResult> {
    if files.is_empty() {
        return Err(Error::validation("no files submitted"));
    }

    let mut accepted = Vec::with_capacity(files.len());
    let mut truncated = Vec::new();

    for file in files {
        if file.bytes.is_empty() {
            return Err(Error::validation(format!("file {} is empty", file.name)));
        }
        if file.bytes.len() > MAX_FILE_BYTES {
            return Err(Error::validation(format!(
                "file {} exceeds the {}-byte limit",
                file.name, MAX_FILE_BYTES
            )));
        }
        if file.kind == FileKind::Pdf {
            let pages = pdf_page_count(&file.bytes);
            if pages > MAX_PDF_PAGES {
                truncated.push((file.name.clone(), pages));
                events.emit(
                    EventType::Error,
                    json!({
                        "warning": "pdf_truncated",
                        "file": file.name,
                        "pages": pages,
                        "max_pages": MAX_PDF_PAGES,
                    }),
                );
            }
        }
        accepted.push(file);
    }

    events.emit(
        EventType::IntakeCompleted,
        json!({ "accepted": accepted.len(), "truncated": truncated.len() }),
    );

    Ok(IntakeResult {
        accepted,
        truncated_pdf_pages: truncated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunId;

    fn file(name: &str, kind: FileKind, bytes: Vec<u8>) -> UploadedFile {
        UploadedFile { name: name.into(), kind, bytes }
    }

    #[test]
    fn rejects_empty_file_list() {
        let events = EventLog::new(RunId::new());
        let result = intake(vec![], |_| 1, &events);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_empty_file_contents() {
        let events = EventLog::new(RunId::new());
        let result = intake(vec![file("a.png", FileKind::Png, vec![])], |_| 1, &events);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_oversized_file() {
        let events = EventLog::new(RunId::new());
        let big = vec![0u8; MAX_FILE_BYTES + 1];
        let result = intake(vec![file("a.png", FileKind::Png, big)], |_| 1, &events);
        assert!(result.is_err());
    }

    #[test]
    fn truncates_long_pdfs_with_a_warning_event_instead_of_rejecting() {
        let events = EventLog::new(RunId::new());
        let result = intake(
            vec![file("answers.pdf", FileKind::Pdf, vec![1, 2, 3])],
            |_| 120,
            &events,
        )
        .unwrap();
        assert_eq!(result.truncated_pdf_pages, vec![("answers.pdf".to_string(), 120)]);
        assert_eq!(result.accepted.len(), 1);
    }
}
