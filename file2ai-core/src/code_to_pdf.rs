//! Plain text to PDF, one monospaced line per source line.
//!
//! Uses printpdf's built-in Courier, so no font files are needed. Characters
//! outside Latin-1 are replaced with `?`.

use printpdf::{
    BuiltinFont, Mm, Op, PdfDocument, PdfPage, PdfSaveOptions, Point, Pt, TextItem,
};
use tracing::debug;

const PAGE_WIDTH_MM: f32 = 210.0;
const PAGE_HEIGHT_MM: f32 = 297.0;
const MARGIN_MM: f32 = 15.0;
const FONT_SIZE_PT: f32 = 9.0;
const LINE_HEIGHT_PT: f32 = 11.0;
const MAX_COLUMNS: usize = 100;

/// Renders `text` into PDF bytes titled `title`.
pub fn text_to_pdf(title: &str, text: &str) -> Vec<u8> {
    let lines = layout_lines(text);
    let usable_pt = Mm(PAGE_HEIGHT_MM - 2.0 * MARGIN_MM).into_pt().0;
    let lines_per_page = ((usable_pt / LINE_HEIGHT_PT).floor() as usize).max(1);

    let mut doc = PdfDocument::new(title);
    let mut pages = Vec::new();
    for chunk in lines.chunks(lines_per_page) {
        pages.push(PdfPage::new(
            Mm(PAGE_WIDTH_MM),
            Mm(PAGE_HEIGHT_MM),
            page_ops(chunk),
        ));
    }
    if pages.is_empty() {
        pages.push(PdfPage::new(
            Mm(PAGE_WIDTH_MM),
            Mm(PAGE_HEIGHT_MM),
            page_ops(&[]),
        ));
    }
    debug!(title, pages = pages.len(), lines = lines.len(), "Rendering PDF");

    let mut warnings = Vec::new();
    doc.with_pages(pages)
        .save(&PdfSaveOptions::default(), &mut warnings)
}

fn page_ops(lines: &[String]) -> Vec<Op> {
    let mut ops = vec![
        Op::StartTextSection,
        Op::SetTextCursor {
            pos: Point {
                x: Mm(MARGIN_MM).into_pt(),
                y: Mm(PAGE_HEIGHT_MM - MARGIN_MM).into_pt(),
            },
        },
        Op::SetFontSizeBuiltinFont {
            size: Pt(FONT_SIZE_PT),
            font: BuiltinFont::Courier,
        },
        Op::SetLineHeight {
            lh: Pt(LINE_HEIGHT_PT),
        },
    ];
    for line in lines {
        ops.push(Op::WriteTextBuiltinFont {
            items: vec![TextItem::Text(line.clone())],
            font: BuiltinFont::Courier,
        });
        ops.push(Op::AddLineBreak);
    }
    ops.push(Op::EndTextSection);
    ops
}

/// Expands tabs, replaces unsupported characters and hard-wraps long lines.
fn layout_lines(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for raw in text.lines() {
        let cleaned: String = raw
            .replace('\t', "    ")
            .chars()
            .map(|c| if (c as u32) < 0x100 && !c.is_control() { c } else { '?' })
            .collect();
        let chars: Vec<char> = cleaned.chars().collect();
        if chars.is_empty() {
            out.push(String::new());
            continue;
        }
        for chunk in chars.chunks(MAX_COLUMNS) {
            out.push(chunk.iter().collect());
        }
    }
    out
}
