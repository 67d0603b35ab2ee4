//! Table fix-up for DOCX uploads.
//!
//! Field extraction works page by page, so a form field's label and value
//! must land on the same rendered page. Word happily splits a table row
//! across a page break, which puts "Commercial Register No." on page 2 and
//! its value on page 3. Setting "keep lines together" and "keep with next"
//! on the first paragraph of every table cell stops that.
//!
//! A DOCX file is a zip archive; the body lives in `word/document.xml`.
//! Only that part is rewritten, every other entry is copied byte for byte.
//! In WordprocessingML the two flags are `<w:keepNext/>` and
//! `<w:keepLines/>` inside the paragraph's `<w:pPr>`, right after an
//! optional `<w:pStyle/>`.

use once_cell::sync::Lazy;
use regex::Regex;
use std::io::{Cursor, Read, Write};
use thiserror::Error;
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Archive entry holding the document body.
pub const DOCUMENT_PART: &str = "word/document.xml";

const KEEP_FLAGS: &str = "<w:keepNext/><w:keepLines/>";

#[derive(Debug, Error)]
pub enum DocxError {
    #[error("not a DOCX archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("I/O error while rewriting archive: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive has no {DOCUMENT_PART}")]
    MissingBody,
}

static RE_CELL_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"<w:tc(?:\s[^>]*)?>").unwrap());

static RE_PARA_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<w:p(?:\s[^>]*?)?(/?)>").unwrap());

static RE_PPR_LEAD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*<w:pPr(?:\s[^>]*?)?(/?)>").unwrap());

static RE_PPR_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<w:pPr(?:\s[^>]*?)?(/?)>|</w:pPr>").unwrap());

static RE_KEEP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<w:keep(?:Next|Lines)(?:\s[^>]*)?/>").unwrap());

static RE_PSTYLE_LEAD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*<w:pStyle(?:\s[^>]*)?/>").unwrap());

/// Rewrite a DOCX archive so no table row splits across pages.
///
/// Idempotent: running it on its own output changes nothing.
pub fn prevent_table_split(docx: &[u8]) -> Result<Vec<u8>, DocxError> {
    let mut archive = ZipArchive::new(Cursor::new(docx))?;
    let mut writer = ZipWriter::new(Cursor::new(Vec::with_capacity(docx.len())));
    let mut saw_body = false;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.name() == DOCUMENT_PART {
            let mut xml = String::new();
            entry.read_to_string(&mut xml)?;
            let fixed = fix_document_xml(&xml);

            let options =
                SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
            writer.start_file(DOCUMENT_PART, options)?;
            writer.write_all(fixed.as_bytes())?;
            saw_body = true;
        } else {
            writer.raw_copy_file(entry)?;
        }
    }

    if !saw_body {
        return Err(DocxError::MissingBody);
    }
    Ok(writer.finish()?.into_inner())
}

/// Apply the keep-together flags to the first paragraph of every table cell.
pub fn fix_document_xml(xml: &str) -> String {
    let mut targets: Vec<usize> = RE_CELL_OPEN
        .find_iter(xml)
        .filter_map(|cell| RE_PARA_OPEN.find_at(xml, cell.end()).map(|p| p.start()))
        .collect();
    targets.sort_unstable();
    targets.dedup();
    debug!("Table fix-up: {} cell paragraphs", targets.len());

    let mut out = String::with_capacity(xml.len() + targets.len() * KEEP_FLAGS.len() * 2);
    let mut cursor = 0;

    for start in targets {
        let Some(caps) = RE_PARA_OPEN.captures_at(xml, start) else {
            continue;
        };
        let Some(open) = caps.get(0) else { continue };
        let self_closing = caps.get(1).is_some_and(|g| g.as_str() == "/");

        out.push_str(&xml[cursor..open.start()]);

        if self_closing {
            // <w:p .../>  →  <w:p ...><w:pPr>FLAGS</w:pPr></w:p>
            let tag = open.as_str();
            out.push_str(tag[..tag.len() - 2].trim_end());
            out.push('>');
            out.push_str("<w:pPr>");
            out.push_str(KEEP_FLAGS);
            out.push_str("</w:pPr></w:p>");
            cursor = open.end();
            continue;
        }

        out.push_str(open.as_str());
        cursor = open.end();
        let rest = &xml[cursor..];

        let Some(ppr) = RE_PPR_LEAD.captures(rest) else {
            out.push_str("<w:pPr>");
            out.push_str(KEEP_FLAGS);
            out.push_str("</w:pPr>");
            continue;
        };
        let Some(ppr_open) = ppr.get(0) else { continue };

        if ppr.get(1).is_some_and(|g| g.as_str() == "/") {
            // <w:pPr/> carries nothing worth keeping
            let lead = &ppr_open.as_str()[..ppr_open.as_str().len() - ppr_open.as_str().trim_start().len()];
            out.push_str(lead);
            out.push_str("<w:pPr>");
            out.push_str(KEEP_FLAGS);
            out.push_str("</w:pPr>");
            cursor += ppr_open.end();
            continue;
        }

        let inner_start = cursor + ppr_open.end();
        let Some(inner_end) = matching_ppr_close(xml, inner_start) else {
            // Unbalanced markup: leave this paragraph as it is.
            continue;
        };

        out.push_str(&xml[cursor..inner_start]);
        let inner = &xml[inner_start..inner_end];
        // <w:pPrChange> holds revision history with its own nested pPr.
        let split = inner.find("<w:pPrChange").unwrap_or(inner.len());
        out.push_str(&with_keep_flags(&inner[..split]));
        out.push_str(&inner[split..]);
        cursor = inner_end;
    }

    out.push_str(&xml[cursor..]);
    out
}

/// Byte offset of the `</w:pPr>` closing the element whose content starts at `from`.
fn matching_ppr_close(xml: &str, from: usize) -> Option<usize> {
    let mut depth = 1usize;
    for caps in RE_PPR_TAG.captures_iter(&xml[from..]) {
        let tag = caps.get(0)?;
        if tag.as_str() == "</w:pPr>" {
            depth -= 1;
            if depth == 0 {
                return Some(from + tag.start());
            }
        } else if caps.get(1).is_some_and(|g| g.as_str().is_empty()) {
            depth += 1;
        }
    }
    None
}

/// Direct children of a `<w:pPr>` with keepNext/keepLines forced on.
fn with_keep_flags(children: &str) -> String {
    let cleaned = RE_KEEP.replace_all(children, "");
    match RE_PSTYLE_LEAD.find(&cleaned) {
        Some(style) => format!(
            "{}{}{}",
            &cleaned[..style.end()],
            KEEP_FLAGS,
            &cleaned[style.end()..]
        ),
        None => format!("{KEEP_FLAGS}{cleaned}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = concat!(
        r#"<w:document><w:body>"#,
        r#"<w:p><w:r><w:t>Intro</w:t></w:r></w:p>"#,
        r#"<w:tbl><w:tr>"#,
        r#"<w:tc><w:tcPr><w:tcW w:w="2000"/></w:tcPr><w:p w:rsidR="1"><w:r><w:t>Commercial Register No.</w:t></w:r></w:p><w:p><w:r><w:t>second</w:t></w:r></w:p></w:tc>"#,
        r#"<w:tc><w:p><w:pPr><w:pStyle w:val="Body"/><w:jc w:val="left"/></w:pPr><w:r><w:t>1010123456</w:t></w:r></w:p></w:tc>"#,
        r#"<w:tc><w:p><w:pPr><w:keepNext w:val="0"/><w:spacing w:after="0"/></w:pPr></w:p></w:tc>"#,
        r#"<w:tc><w:p/></w:tc>"#,
        r#"</w:tr></w:tbl>"#,
        r#"</w:body></w:document>"#
    );

    fn docx_with(body: &str) -> Vec<u8> {
        let mut w = ZipWriter::new(Cursor::new(Vec::new()));
        let opts = SimpleFileOptions::default();
        w.start_file("[Content_Types].xml", opts).unwrap();
        w.write_all(b"<Types/>").unwrap();
        w.start_file(DOCUMENT_PART, opts).unwrap();
        w.write_all(body.as_bytes()).unwrap();
        w.start_file("word/styles.xml", opts).unwrap();
        w.write_all(b"<w:styles/>").unwrap();
        w.finish().unwrap().into_inner()
    }

    fn body_of(docx: &[u8]) -> String {
        let mut archive = ZipArchive::new(Cursor::new(docx)).unwrap();
        let mut entry = archive.by_name(DOCUMENT_PART).unwrap();
        let mut xml = String::new();
        entry.read_to_string(&mut xml).unwrap();
        xml
    }

    #[test]
    fn first_cell_paragraph_gets_flags() {
        let fixed = fix_document_xml(BODY);
        assert!(fixed.contains(
            r#"<w:p w:rsidR="1"><w:pPr><w:keepNext/><w:keepLines/></w:pPr><w:r><w:t>Commercial"#
        ));
        // only the first paragraph of the cell
        assert!(fixed.contains(r#"<w:p><w:r><w:t>second</w:t>"#));
        // paragraphs outside tables untouched
        assert!(fixed.contains(r#"<w:p><w:r><w:t>Intro</w:t>"#));
    }

    #[test]
    fn flags_follow_paragraph_style() {
        let fixed = fix_document_xml(BODY);
        assert!(fixed.contains(
            r#"<w:pPr><w:pStyle w:val="Body"/><w:keepNext/><w:keepLines/><w:jc w:val="left"/></w:pPr>"#
        ));
    }

    #[test]
    fn disabled_flags_are_replaced() {
        let fixed = fix_document_xml(BODY);
        assert!(!fixed.contains(r#"w:keepNext w:val="0""#));
        assert!(fixed.contains(
            r#"<w:pPr><w:keepNext/><w:keepLines/><w:spacing w:after="0"/></w:pPr>"#
        ));
    }

    #[test]
    fn self_closing_paragraph_is_expanded() {
        let fixed = fix_document_xml(BODY);
        assert!(fixed.contains(
            r#"<w:tc><w:p><w:pPr><w:keepNext/><w:keepLines/></w:pPr></w:p></w:tc>"#
        ));
    }

    #[test]
    fn revision_history_is_left_alone() {
        let xml = concat!(
            r#"<w:tc><w:p><w:pPr><w:jc w:val="center"/>"#,
            r#"<w:pPrChange w:id="1"><w:pPr><w:keepNext/></w:pPr></w:pPrChange>"#,
            r#"</w:pPr></w:p></w:tc>"#
        );
        let fixed = fix_document_xml(xml);
        assert_eq!(
            fixed,
            concat!(
                r#"<w:tc><w:p><w:pPr><w:keepNext/><w:keepLines/><w:jc w:val="center"/>"#,
                r#"<w:pPrChange w:id="1"><w:pPr><w:keepNext/></w:pPr></w:pPrChange>"#,
                r#"</w:pPr></w:p></w:tc>"#
            )
        );
    }

    #[test]
    fn fixup_is_idempotent() {
        let once = fix_document_xml(BODY);
        let twice = fix_document_xml(&once);
        assert_eq!(once, twice);

        let docx = docx_with(BODY);
        let once = prevent_table_split(&docx).unwrap();
        let twice = prevent_table_split(&once).unwrap();
        assert_eq!(body_of(&once), body_of(&twice));
    }

    #[test]
    fn other_parts_are_preserved() {
        let fixed = prevent_table_split(&docx_with(BODY)).unwrap();
        let mut archive = ZipArchive::new(Cursor::new(fixed.as_slice())).unwrap();
        assert_eq!(archive.len(), 3);
        let mut styles = String::new();
        archive
            .by_name("word/styles.xml")
            .unwrap()
            .read_to_string(&mut styles)
            .unwrap();
        assert_eq!(styles, "<w:styles/>");
    }

    #[test]
    fn rejects_non_archives_and_missing_body() {
        assert!(matches!(
            prevent_table_split(b"definitely not a zip"),
            Err(DocxError::Archive(_))
        ));

        let mut w = ZipWriter::new(Cursor::new(Vec::new()));
        w.start_file("word/styles.xml", SimpleFileOptions::default()).unwrap();
        w.write_all(b"<w:styles/>").unwrap();
        let bytes = w.finish().unwrap().into_inner();
        assert!(matches!(prevent_table_split(&bytes), Err(DocxError::MissingBody)));
    }
}
