use log::{debug, warn};
use lopdf::{Document, Object};

use crate::error::DashReportError;

const PDF_MAGIC: &[u8] = b"%PDF-";

// Text that only shows up when the login screen was rendered instead of the dashboard
const LOGIN_MARKERS: [&str; 3] = ["welcome to grafana", "forgot your password", "log in with"];

/// Facts about a rendered PDF that the run record keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdfSummary {
    pub pages: usize,
}

/// Reject output that is not a usable report: not a PDF, unparseable,
/// empty, or the login screen.
pub fn inspect_pdf(bytes: &[u8]) -> Result<PdfSummary, DashReportError> {
    if !bytes.starts_with(PDF_MAGIC) {
        if looks_like_html(bytes) {
            return Err(DashReportError::AuthenticationPage(
                "renderer returned HTML instead of a PDF".to_string(),
            ));
        }
        return Err(DashReportError::Render(format!(
            "output is not a PDF (got {} bytes)",
            bytes.len()
        )));
    }

    let doc = Document::load_mem(bytes)
        .map_err(|e| DashReportError::Render(format!("rendered PDF does not parse: {}", e)))?;

    for object in doc.objects.values() {
        if let Err(e) = validate_object(object) {
            return Err(DashReportError::Render(format!(
                "rendered PDF is corrupt: {}",
                e
            )));
        }
    }

    let pages = doc.get_pages().len();
    if pages == 0 {
        return Err(DashReportError::Render("rendered PDF has no pages".to_string()));
    }

    // A login screen fits on one page; long reports are never it
    if pages == 1 {
        match doc.extract_text(&[1]) {
            Ok(text) => {
                let text = text.to_lowercase();
                if let Some(marker) = LOGIN_MARKERS.iter().find(|m| text.contains(*m)) {
                    return Err(DashReportError::AuthenticationPage(format!(
                        "rendered page contains '{}'",
                        marker
                    )));
                }
            }
            Err(e) => debug!("Could not extract text from rendered PDF: {}", e),
        }
    }

    Ok(PdfSummary { pages })
}

fn looks_like_html(bytes: &[u8]) -> bool {
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(512)]).to_lowercase();
    let head = head.trim_start();
    head.starts_with("<!doctype html") || head.starts_with("<html")
}

/// Decompress every stream so truncated output is caught before it is stored
fn validate_object(object: &Object) -> Result<(), lopdf::Error> {
    match object {
        Object::Stream(stream) => {
            if stream.is_compressed() {
                match stream.decompressed_content() {
                    Ok(_) => {}
                    Err(lopdf::Error::Unimplemented(reason)) => {
                        warn!("Lopdf unimplemented feature: {reason}");
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Object::Array(arr) => {
            for item in arr {
                validate_object(item)?;
            }
        }
        Object::Dictionary(dict) => {
            for (_key, value) in dict.iter() {
                validate_object(value)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// A minimal PDF with one text line per page
#[cfg(test)]
pub fn test_pdf(pages: &[&str]) -> Vec<u8> {
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Stream};

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids: Vec<Object> = Vec::new();
    for text in pages {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 24.into()]),
                Operation::new("Td", vec![72.into(), 700.into()]),
                Operation::new("Tj", vec![Object::string_literal(*text)]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();
    bytes
}
