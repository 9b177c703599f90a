//! Byte-to-text converters for downloaded attachments. Both converters
//! degrade to an empty string on malformed input so one broken file never
//! aborts the surrounding item.

use std::io::{Cursor, Read};

use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::warn;

/// Extract text from a PDF page by page, skipping pages with no readable
/// text.
pub fn pdf_text(bytes: &[u8]) -> String {
    let doc = match lopdf::Document::load_mem(bytes) {
        Ok(doc) => doc,
        Err(err) => {
            warn!(error = %err, "failed to parse PDF payload");
            return String::new();
        }
    };

    let mut pages = Vec::new();
    for (page_num, _) in doc.get_pages() {
        if let Ok(page_text) = doc.extract_text(&[page_num]) {
            let trimmed = page_text.trim();
            if !trimmed.is_empty() {
                pages.push(trimmed.to_string());
            }
        }
    }
    pages.join("\n")
}

/// Extract paragraph text from a DOCX payload by streaming the main
/// document part.
pub fn docx_text(bytes: &[u8]) -> String {
    let mut archive = match zip::ZipArchive::new(Cursor::new(bytes)) {
        Ok(archive) => archive,
        Err(err) => {
            warn!(error = %err, "failed to open DOCX payload");
            return String::new();
        }
    };

    let mut xml = String::new();
    match archive.by_name("word/document.xml") {
        Ok(mut part) => {
            if part.read_to_string(&mut xml).is_err() {
                return String::new();
            }
        }
        Err(err) => {
            warn!(error = %err, "DOCX payload has no document.xml");
            return String::new();
        }
    }

    paragraphs_from_xml(&xml)
}

/// Text runs live in `w:t` elements; each non-empty `w:p` becomes one line.
fn paragraphs_from_xml(xml: &str) -> String {
    let mut reader = Reader::from_str(xml);

    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text = true;
                }
            }
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    if !current.is_empty() {
                        paragraphs.push(std::mem::take(&mut current));
                    }
                }
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if in_text {
                    if let Ok(decoded) = e.unescape() {
                        current.push_str(&decoded);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => {
                warn!(error = %err, "DOCX document.xml is not well-formed");
                break;
            }
            _ => {}
        }
    }

    if !current.is_empty() {
        paragraphs.push(current);
    }
    paragraphs.join("\n")
}
