//! Text extraction: the collaborator that turns a stored document into the
//! plain text written to the artifact directory.
//!
//! [`Extractor`] is the seam; [`TextExtractor`] is the default and handles
//! PDF, DOCX, HTML, CSV and plain text. Scanned documents that need OCR are
//! out of reach for it and come back as [`ExtractionError::Empty`]; plug in
//! another extractor for those.

use std::io::Read;
use std::path::Path;

use scraper::Html;

use crate::error::ExtractionError;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_HTML: &str = "text/html";
pub const MIME_CSV: &str = "text/csv";
pub const MIME_TEXT: &str = "text/plain";

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Elements whose text never reaches the artifact.
const HIDDEN_ELEMENTS: [&str; 5] = ["script", "style", "noscript", "template", "head"];

/// Produces plain text from a local file and its declared content type.
///
/// Called from blocking worker threads.
pub trait Extractor: Send + Sync {
    fn extract(&self, path: &Path, content_type: &str) -> Result<String, ExtractionError>;
}

/// Built-in extractor for the formats the vault can ingest without OCR.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextExtractor;

impl Extractor for TextExtractor {
    fn extract(&self, path: &Path, content_type: &str) -> Result<String, ExtractionError> {
        let bytes = std::fs::read(path).map_err(|e| ExtractionError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let text = extract_text(&bytes, content_type)?;
        if text.trim().is_empty() {
            return Err(ExtractionError::Empty {
                path: path.to_path_buf(),
            });
        }
        Ok(text)
    }
}

/// Content classes the vault distinguishes when ingesting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentClass {
    Pdf,
    Docx,
    Csv,
    Html,
    Text,
}

impl ContentClass {
    /// Canonical MIME type handed to the extractor.
    pub fn mime(&self) -> &'static str {
        match self {
            ContentClass::Pdf => MIME_PDF,
            ContentClass::Docx => MIME_DOCX,
            ContentClass::Csv => MIME_CSV,
            ContentClass::Html => MIME_HTML,
            ContentClass::Text => MIME_TEXT,
        }
    }
}

/// Classify remote content from its media type, falling back to the URL path.
///
/// Checked in order: PDF, DOCX, CSV, HTML, then any other `text/*`.
/// A path ending in `/` is taken as an HTML page.
pub fn classify(mime: Option<&str>, url_path: &str) -> Result<ContentClass, ExtractionError> {
    let mime = mime.unwrap_or("").to_ascii_lowercase();
    let path = url_path.to_ascii_lowercase();

    if mime.contains("pdf") || path.ends_with(".pdf") {
        return Ok(ContentClass::Pdf);
    }
    if mime.contains("officedocument.wordprocessingml.document") || path.ends_with(".docx") {
        return Ok(ContentClass::Docx);
    }
    if mime.contains("text/csv") || path.ends_with(".csv") {
        return Ok(ContentClass::Csv);
    }
    if mime.contains("html")
        || path.ends_with(".html")
        || path.ends_with(".htm")
        || path.ends_with('/')
    {
        return Ok(ContentClass::Html);
    }
    if mime.starts_with("text/") {
        return Ok(ContentClass::Text);
    }

    Err(ExtractionError::UnsupportedContentType(if mime.is_empty() {
        "unknown".to_string()
    } else {
        mime
    }))
}

/// Declared content type of a local file, by extension.
pub fn content_type_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "pdf" => Some(MIME_PDF),
        "docx" => Some(MIME_DOCX),
        "html" | "htm" => Some(MIME_HTML),
        "csv" => Some(MIME_CSV),
        "txt" | "text" | "md" | "log" => Some(MIME_TEXT),
        _ => None,
    }
}

/// Extract plain text from in-memory content of the given type.
pub fn extract_text(bytes: &[u8], content_type: &str) -> Result<String, ExtractionError> {
    let mime = crate::fetch::mime_essence(content_type);
    match mime.as_str() {
        MIME_PDF => extract_pdf(bytes),
        MIME_DOCX => extract_docx(bytes),
        MIME_HTML | "application/xhtml+xml" => Ok(html_to_text(&String::from_utf8_lossy(bytes))),
        MIME_CSV => Ok(flatten_csv(&String::from_utf8_lossy(bytes))),
        m if m.starts_with("text/") => Ok(String::from_utf8_lossy(bytes).into_owned()),
        _ => Err(ExtractionError::UnsupportedContentType(mime)),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractionError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractionError::Pdf(e.to_string()))
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractionError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractionError::Ooxml(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| ExtractionError::Ooxml("word/document.xml not found".to_string()))?;

    let mut doc_xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut doc_xml)
        .map_err(|e| ExtractionError::Ooxml(e.to_string()))?;
    if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractionError::Ooxml(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }

    docx_paragraphs(&doc_xml)
}

/// Text runs of `w:t` elements, one line per non-empty `w:p` paragraph.
fn docx_paragraphs(xml: &[u8]) -> Result<String, ExtractionError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let line = current.trim();
                    if !line.is_empty() {
                        paragraphs.push(line.to_string());
                    }
                    current.clear();
                }
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"tab" => current.push('\t'),
            Ok(Event::Text(te)) if in_text => {
                current.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractionError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    let tail = current.trim();
    if !tail.is_empty() {
        paragraphs.push(tail.to_string());
    }
    Ok(paragraphs.join("\n"))
}

/// Visible text of an HTML document, one trimmed text node per line.
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut lines: Vec<String> = Vec::new();

    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .is_some_and(|el| HIDDEN_ELEMENTS.contains(&el.name()))
        });
        if hidden {
            continue;
        }
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if !collapsed.is_empty() {
            lines.push(collapsed);
        }
    }

    lines.join("\n")
}

/// Flatten CSV rows into tab-separated lines with trimmed cells.
///
/// Handles quoted fields with embedded commas, doubled quotes and newlines.
pub fn flatten_csv(text: &str) -> String {
    let mut rows: Vec<String> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => row.push(std::mem::take(&mut field).trim().to_string()),
            '\r' => {}
            '\n' => {
                row.push(std::mem::take(&mut field).trim().to_string());
                rows.push(std::mem::take(&mut row).join("\t"));
            }
            _ => field.push(c),
        }
    }

    if !field.is_empty() || !row.is_empty() {
        row.push(field.trim().to_string());
        rows.push(row.join("\t"));
    }

    rows.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn classify_follows_precedence() {
        assert_eq!(classify(Some("application/pdf"), "/x").unwrap(), ContentClass::Pdf);
        assert_eq!(classify(None, "/files/report.PDF").unwrap(), ContentClass::Pdf);
        assert_eq!(classify(Some(MIME_DOCX), "/d").unwrap(), ContentClass::Docx);
        assert_eq!(classify(Some("text/csv"), "/d").unwrap(), ContentClass::Csv);
        assert_eq!(classify(Some("text/html; charset=utf-8"), "/").unwrap(), ContentClass::Html);
        assert_eq!(classify(None, "/news/").unwrap(), ContentClass::Html);
        assert_eq!(classify(Some("text/markdown"), "/readme").unwrap(), ContentClass::Text);
    }

    #[test]
    fn classify_rejects_binary() {
        match classify(Some("image/png"), "/logo") {
            Err(ExtractionError::UnsupportedContentType(ct)) => assert_eq!(ct, "image/png"),
            other => panic!("expected unsupported, got {:?}", other),
        }
        assert!(classify(None, "/blob").is_err());
    }

    #[test]
    fn html_text_skips_scripts_and_styles() {
        let html = r#"<html><head><title>T</title><style>body{}</style></head>
            <body><h1>Heading</h1><script>var x = 1;</script>
            <p>First   paragraph
            wraps.</p><noscript>enable js</noscript></body></html>"#;
        assert_eq!(html_to_text(html), "Heading\nFirst paragraph wraps.");
    }

    #[test]
    fn csv_rows_become_tab_lines() {
        let csv = "name, amount\r\n\"Smith, J\",\"1\"\"000\"\n\"multi\nline\",2";
        assert_eq!(
            flatten_csv(csv),
            "name\tamount\nSmith, J\t1\"000\nmulti\nline\t2"
        );
    }

    #[test]
    fn extract_text_dispatches_by_mime() {
        assert_eq!(
            extract_text(b"plain body", "text/plain; charset=utf-8").unwrap(),
            "plain body"
        );
        assert_eq!(extract_text(b"a,b\n1,2\n", "text/csv").unwrap(), "a\tb\n1\t2");
        assert!(matches!(
            extract_text(b"\x89PNG", "image/png"),
            Err(ExtractionError::UnsupportedContentType(_))
        ));
    }

    #[test]
    fn docx_paragraphs_from_zip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("memo.docx");
        {
            let file = std::fs::File::create(&path).unwrap();
            let mut zip = zip::ZipWriter::new(file);
            zip.start_file(
                "word/document.xml",
                zip::write::SimpleFileOptions::default(),
            )
            .unwrap();
            zip.write_all(
                br#"<?xml version="1.0"?><w:document xmlns:w="w"><w:body>
                <w:p><w:r><w:t>Hello</w:t></w:r><w:r><w:t xml:space="preserve"> world</w:t></w:r></w:p>
                <w:p><w:r><w:t>Second &amp; last</w:t></w:r></w:p>
                </w:body></w:document>"#,
            )
            .unwrap();
            zip.finish().unwrap();
        }
        let text = TextExtractor.extract(&path, MIME_DOCX).unwrap();
        assert_eq!(text, "Hello world\nSecond & last");
    }

    #[test]
    fn empty_text_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("blank.txt");
        std::fs::write(&path, "   \n").unwrap();
        assert!(matches!(
            TextExtractor.extract(&path, MIME_TEXT),
            Err(ExtractionError::Empty { .. })
        ));
    }

    #[test]
    fn content_type_by_extension() {
        assert_eq!(content_type_for_path(Path::new("a/report.pdf")), Some(MIME_PDF));
        assert_eq!(content_type_for_path(Path::new("notes.TXT")), Some(MIME_TEXT));
        assert_eq!(content_type_for_path(Path::new("image.png")), None);
        assert_eq!(content_type_for_path(Path::new("noext")), None);
    }
}
