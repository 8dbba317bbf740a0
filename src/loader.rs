//! Extension-dispatched document loaders.
//!
//! Each loader is a flat implementation of the capability pair
//! `supports(path)` / `load(path)`; dispatch iterates a static registry
//! rather than descending a type hierarchy. Every loader returns plain
//! [`Document`]s with a `source` metadata key; binary formats never panic,
//! they return [`Error::Loader`] and the pipeline skips the file.
//!
//! Supported formats: `.txt` (UTF-8 → GBK → GB18030 → Latin-1 fallback),
//! `.md` (section-aware), `.pdf` (one document per page), `.docx`
//! (paragraph breaks preserved).

use std::io::Read;
use std::path::Path;

use crate::error::{Error, Result};
use crate::models::Document;

/// Default size cap; larger files are rejected before any parsing.
pub const DEFAULT_MAX_FILE_BYTES: u64 = 100 * 1024 * 1024;

/// Cap on a single decompressed ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Capability set every loader implements.
pub trait Loader: Send + Sync {
    /// Lowercased extension this loader answers to.
    fn supports(&self, path: &Path) -> bool;
    fn load(&self, path: &Path) -> Result<Vec<Document>>;
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

static LOADERS: &[&(dyn Loader)] = &[&TextLoader, &MarkdownLoader, &PdfLoader, &DocxLoader];

/// True when some registered loader can handle the path.
pub fn is_supported(path: &Path) -> bool {
    LOADERS.iter().any(|l| l.supports(path))
}

/// Load a file by dispatching to the first loader that supports its
/// extension. Files above `max_bytes` are rejected.
pub fn load_file(path: &Path, max_bytes: u64) -> Result<Vec<Document>> {
    let meta = std::fs::metadata(path)
        .map_err(|e| Error::Loader(format!("{}: {e}", path.display())))?;
    if meta.len() > max_bytes {
        return Err(Error::Loader(format!(
            "{}: file size {} exceeds limit {}",
            path.display(),
            meta.len(),
            max_bytes
        )));
    }

    for loader in LOADERS {
        if loader.supports(path) {
            return loader.load(path);
        }
    }
    Err(Error::Loader(format!(
        "{}: unsupported file type '.{}'",
        path.display(),
        extension_of(path)
    )))
}

fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| Error::Loader(format!("{}: {e}", path.display())))
}

/// Decode text trying UTF-8 first, then the legacy Chinese encodings, then
/// Latin-1 as a lossless last resort.
fn decode_text(bytes: &[u8]) -> String {
    if let Ok(s) = std::str::from_utf8(bytes) {
        return s.to_string();
    }
    for encoding in [encoding_rs::GBK, encoding_rs::GB18030] {
        let (decoded, _, had_errors) = encoding.decode(bytes);
        if !had_errors {
            return decoded.into_owned();
        }
    }
    // Latin-1: every byte maps to a code point, so this cannot fail.
    bytes.iter().map(|&b| b as char).collect()
}

// ============ Plain text ============

pub struct TextLoader;

impl Loader for TextLoader {
    fn supports(&self, path: &Path) -> bool {
        extension_of(path) == "txt"
    }

    fn load(&self, path: &Path) -> Result<Vec<Document>> {
        let bytes = read_bytes(path)?;
        let text = decode_text(&bytes);
        Ok(vec![Document::new(text, &path.display().to_string())])
    }
}

// ============ Markdown ============

/// Splits on ATX headings so each section becomes its own document with a
/// `section` metadata key. Text without headings loads as a single document.
pub struct MarkdownLoader;

impl Loader for MarkdownLoader {
    fn supports(&self, path: &Path) -> bool {
        extension_of(path) == "md"
    }

    fn load(&self, path: &Path) -> Result<Vec<Document>> {
        let bytes = read_bytes(path)?;
        let text = decode_text(&bytes);
        let source = path.display().to_string();

        let mut sections: Vec<(Option<String>, String)> = Vec::new();
        let mut current_title: Option<String> = None;
        let mut current_body = String::new();

        for line in text.lines() {
            let trimmed = line.trim_start();
            if trimmed.starts_with('#') {
                if !current_body.trim().is_empty() || current_title.is_some() {
                    sections.push((current_title.take(), std::mem::take(&mut current_body)));
                }
                current_title = Some(trimmed.trim_start_matches('#').trim().to_string());
            }
            current_body.push_str(line);
            current_body.push('\n');
        }
        if !current_body.trim().is_empty() {
            sections.push((current_title, current_body));
        }

        if sections.len() <= 1 {
            // No structure worth preserving; fall back to plain text.
            return Ok(vec![Document::new(text, &source)]);
        }

        Ok(sections
            .into_iter()
            .filter(|(_, body)| !body.trim().is_empty())
            .map(|(title, body)| {
                let mut doc = Document::new(body, &source);
                if let Some(title) = title {
                    doc.metadata
                        .insert("section".to_string(), serde_json::json!(title));
                }
                doc
            })
            .collect())
    }
}

// ============ PDF ============

/// One document per page; `page` metadata is 1-based.
pub struct PdfLoader;

impl Loader for PdfLoader {
    fn supports(&self, path: &Path) -> bool {
        extension_of(path) == "pdf"
    }

    fn load(&self, path: &Path) -> Result<Vec<Document>> {
        let bytes = read_bytes(path)?;
        let source = path.display().to_string();
        let pages = pdf_extract::extract_text_from_mem_by_pages(&bytes)
            .map_err(|e| Error::Loader(format!("{source}: PDF extraction failed: {e}")))?;

        Ok(pages
            .into_iter()
            .enumerate()
            .map(|(i, text)| {
                let mut doc = Document::new(text, &source);
                doc.metadata
                    .insert("page".to_string(), serde_json::json!(i + 1));
                doc
            })
            .collect())
    }
}

// ============ DOCX ============

/// Concatenates body text from `word/document.xml`, emitting a newline at
/// each paragraph end.
pub struct DocxLoader;

impl Loader for DocxLoader {
    fn supports(&self, path: &Path) -> bool {
        extension_of(path) == "docx"
    }

    fn load(&self, path: &Path) -> Result<Vec<Document>> {
        let bytes = read_bytes(path)?;
        let source = path.display().to_string();
        let text = extract_docx_text(&bytes)
            .map_err(|e| Error::Loader(format!("{source}: {e}")))?;
        Ok(vec![Document::new(text, &source)])
    }
}

fn extract_docx_text(bytes: &[u8]) -> std::result::Result<String, String> {
    let mut archive =
        zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| e.to_string())?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| "word/document.xml not found".to_string())?;

    let mut doc_xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut doc_xml)
        .map_err(|e| e.to_string())?;
    if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err("word/document.xml exceeds size limit".to_string());
    }

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(doc_xml.as_slice());
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text = true;
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if in_text => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}
