//! Plain-text extraction for fetched documents.
//!
//! HTML pages lose their `script`, `style`, `noscript`, `nav`, `header` and
//! `footer` blocks, are narrowed to `<main>` when the page has one, and are
//! rendered to text with `html2text`. PDFs are extracted page by page with
//! `pdf-extract`; pages are joined with `[page N]` markers so excerpts can
//! be traced back to a page.

use std::collections::HashSet;
use std::fmt::Write as _;

use reqwest::Url;

use crate::error::ExtractionError;

pub const MIME_PDF: &str = "application/pdf";

/// Blocks removed before an HTML page is rendered to text.
const STRIPPED_BLOCKS: &[&str] = &["script", "style", "noscript", "nav", "header", "footer"];

/// Wrap width handed to html2text. Normalization collapses the line breaks.
const TEXT_WIDTH: usize = 200;

/// How a fetched body should be turned into text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Html,
    Pdf,
    PlainText,
}

/// Decide the document kind from the response `Content-Type` and the URL.
pub fn classify(content_type: Option<&str>, url: &Url) -> Result<DocumentKind, ExtractionError> {
    let mime = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase())
        .unwrap_or_default();

    if mime == MIME_PDF || url.path().to_ascii_lowercase().ends_with(".pdf") {
        return Ok(DocumentKind::Pdf);
    }
    match mime.as_str() {
        "" | "text/html" | "application/xhtml+xml" => Ok(DocumentKind::Html),
        "text/plain" => Ok(DocumentKind::PlainText),
        other => Err(ExtractionError::UnsupportedContentType(other.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtmlExtract {
    pub title: String,
    pub text: String,
    /// Absolute URLs of same-host `.pdf` links in the content region.
    pub pdf_links: Vec<String>,
}

pub fn extract_html(html: &str, page_url: &Url) -> Result<HtmlExtract, ExtractionError> {
    let title = element_text(html, "title")
        .or_else(|| element_text(html, "h1"))
        .unwrap_or_else(|| title_from_url(page_url));

    let mut cleaned = html.to_string();
    for tag in STRIPPED_BLOCKS {
        cleaned = strip_blocks(&cleaned, tag);
    }
    let content = main_region(&cleaned).unwrap_or(&cleaned);

    Ok(HtmlExtract {
        title,
        text: html_to_text(content)?,
        pdf_links: pdf_links(content, page_url),
    })
}

/// Text of every page, each preceded by `[page N]`. Pages without text are
/// omitted but keep their numbering.
pub fn extract_pdf_pages(bytes: &[u8]) -> Result<String, ExtractionError> {
    // pdf-extract panics on some malformed files instead of returning Err.
    let pages = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem_by_pages(bytes))
        .map_err(|_| ExtractionError::CorruptDocument("PDF parser panicked".to_string()))?
        .map_err(|e| ExtractionError::CorruptDocument(e.to_string()))?;

    let mut out = String::new();
    for (i, page) in pages.iter().enumerate() {
        let text = page.trim();
        if text.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        let _ = write!(out, "[page {}]\n{}", i + 1, text);
    }
    Ok(out)
}

/// Fallback title: the last path segment without its extension, with
/// dashes and underscores read as spaces. Falls back to the host.
pub fn title_from_url(url: &Url) -> String {
    let segment = url
        .path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
        .map(|s| s.rsplit_once('.').map_or(s, |(stem, _)| stem))
        .map(|s| s.replace(['-', '_'], " "))
        .filter(|s| !s.trim().is_empty());

    segment.unwrap_or_else(|| url.host_str().unwrap_or("untitled").to_string())
}

fn html_to_text(fragment: &str) -> Result<String, ExtractionError> {
    html2text::config::plain()
        .string_from_read(fragment.as_bytes(), TEXT_WIDTH)
        .map_err(|e| ExtractionError::CorruptDocument(e.to_string()))
}

/// Byte offset of the next `<tag` open tag at or after `from` in an
/// ASCII-lowercased document. `<header` does not match `head`.
fn find_open_tag(lower: &str, tag: &str, from: usize) -> Option<usize> {
    let pat = format!("<{tag}");
    let mut search = from;
    while let Some(rel) = lower[search..].find(&pat) {
        let start = search + rel;
        let after = start + pat.len();
        match lower.as_bytes().get(after) {
            None | Some(b'>' | b'/' | b' ' | b'\t' | b'\n' | b'\r') => return Some(start),
            _ => search = after,
        }
    }
    None
}

/// Remove every `<tag ...>...</tag>` block. An unclosed block runs to the
/// end of the document.
fn strip_blocks(html: &str, tag: &str) -> String {
    let mut out = html.to_string();
    // ASCII lowercasing keeps byte offsets identical between the two copies.
    let mut lower = html.to_ascii_lowercase();
    let close = format!("</{tag}");

    let mut from = 0;
    while let Some(start) = find_open_tag(&lower, tag, from) {
        let end = match lower[start..].find(&close) {
            Some(rel) => {
                let close_at = start + rel;
                lower[close_at..]
                    .find('>')
                    .map_or(lower.len(), |gt| close_at + gt + 1)
            }
            None => lower.len(),
        };
        out.replace_range(start..end, " ");
        lower.replace_range(start..end, " ");
        from = start;
    }
    out
}

fn inner_range(html: &str, tag: &str) -> Option<(usize, usize)> {
    let lower = html.to_ascii_lowercase();
    let start = find_open_tag(&lower, tag, 0)?;
    let inner_start = start + lower[start..].find('>')? + 1;
    let inner_end = inner_start + lower[inner_start..].find(&format!("</{tag}"))?;
    Some((inner_start, inner_end))
}

fn main_region(html: &str) -> Option<&str> {
    let (start, end) = inner_range(html, "main")?;
    let region = &html[start..end];
    (!region.trim().is_empty()).then_some(region)
}

fn element_text(html: &str, tag: &str) -> Option<String> {
    let (start, end) = inner_range(html, tag)?;
    let text = html_to_text(&html[start..end]).ok()?;
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!text.is_empty()).then_some(text)
}

fn pdf_links(fragment: &str, page_url: &Url) -> Vec<String> {
    let lower = fragment.to_ascii_lowercase();
    let bytes = lower.as_bytes();
    let page_host = page_url.host_str().map(|h| h.to_ascii_lowercase());

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    let mut from = 0;

    while let Some(rel) = lower[from..].find("href") {
        let mut i = from + rel + 4;
        from = i;
        while bytes.get(i).is_some_and(|b| b.is_ascii_whitespace()) {
            i += 1;
        }
        if bytes.get(i) != Some(&b'=') {
            continue;
        }
        i += 1;
        while bytes.get(i).is_some_and(|b| b.is_ascii_whitespace()) {
            i += 1;
        }
        let (start, end) = match bytes.get(i) {
            Some(&q) if q == b'"' || q == b'\'' => {
                let start = i + 1;
                let end = fragment[start..]
                    .find(q as char)
                    .map_or(fragment.len(), |p| start + p);
                (start, end)
            }
            Some(_) => {
                let end = fragment[i..]
                    .find(|c: char| c.is_whitespace() || c == '>')
                    .map_or(fragment.len(), |p| i + p);
                (i, end)
            }
            None => break,
        };
        from = end;

        let raw = fragment[start..end].trim().replace("&amp;", "&");
        let Ok(mut resolved) = page_url.join(&raw) else {
            continue;
        };
        resolved.set_fragment(None);
        let same_host = resolved.host_str().map(|h| h.to_ascii_lowercase()) == page_host;
        let is_pdf = resolved.path().to_ascii_lowercase().ends_with(".pdf");
        if matches!(resolved.scheme(), "http" | "https") && same_host && is_pdf {
            let link = resolved.to_string();
            if seen.insert(link.clone()) {
                links.push(link);
            }
        }
    }
    links
}
