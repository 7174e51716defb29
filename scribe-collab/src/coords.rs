//! Translation between tree positions and `{line, column}` coordinates.
//!
//! A line is a text block counted depth-first in document order; the
//! column is the offset inside that block's content. Coordinates survive
//! the transport unchanged even when peers hold slightly different tree
//! shapes around the addressed block.

use serde::{Deserialize, Serialize};

use crate::document::{Document, Visit};

/// Line/column address of a caret.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentPosition {
    pub line: usize,
    /// Accepts `ch` from peers that still send the older field name
    #[serde(alias = "ch")]
    pub column: usize,
}

impl DocumentPosition {
    pub const ORIGIN: DocumentPosition = DocumentPosition { line: 0, column: 0 };

    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

/// Coordinate of the text block containing `offset`.
///
/// Offsets outside every text block (empty document, between blocks)
/// fall back to the origin.
pub fn position_to_coordinate(document: &Document, offset: usize) -> DocumentPosition {
    let mut line = 0;
    let mut found = None;

    document.descendants(|node, position| {
        if !node.is_textblock() {
            return Visit::Descend;
        }
        let start = position + 1;
        let end = start + node.content_size();
        if offset >= start && offset <= end {
            found = Some(DocumentPosition::new(line, offset - start));
            return Visit::Stop;
        }
        line += 1;
        Visit::SkipChildren
    });

    found.unwrap_or(DocumentPosition::ORIGIN)
}

/// Linear offset addressed by `coordinate`, its column clamped to the
/// block. `None` when the line no longer exists; callers drop the cursor.
pub fn coordinate_to_position(document: &Document, coordinate: DocumentPosition) -> Option<usize> {
    let mut line = 0;
    let mut found = None;

    document.descendants(|node, position| {
        if !node.is_textblock() {
            return Visit::Descend;
        }
        if line == coordinate.line {
            let column = coordinate.column.min(node.content_size());
            found = Some(position + 1 + column);
            return Visit::Stop;
        }
        line += 1;
        Visit::SkipChildren
    });

    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Node;

    fn sample() -> Document {
        Document::new(vec![
            Node::heading(2, "Notes"),
            Node::paragraph("Hello world"),
            Node::bullet_list(&["alpha", "", "gamma"]),
            Node::code_block("let x = 1;"),
        ])
    }

    #[test]
    fn test_first_line() {
        let doc = Document::from_paragraphs(&["Hello", "World"]);
        assert_eq!(position_to_coordinate(&doc, 1), DocumentPosition::new(0, 0));
        assert_eq!(position_to_coordinate(&doc, 6), DocumentPosition::new(0, 5));
        assert_eq!(position_to_coordinate(&doc, 10), DocumentPosition::new(1, 2));
    }

    #[test]
    fn test_roundtrip_every_offset_in_every_block() {
        let doc = sample();
        let mut offsets = Vec::new();
        doc.descendants(|node, pos| {
            if node.is_textblock() {
                for col in 0..=node.content_size() {
                    offsets.push(pos + 1 + col);
                }
                return Visit::SkipChildren;
            }
            Visit::Descend
        });
        assert!(!offsets.is_empty());
        for offset in offsets {
            let coord = position_to_coordinate(&doc, offset);
            assert_eq!(coordinate_to_position(&doc, coord), Some(offset), "offset {offset}");
        }
    }

    #[test]
    fn test_nested_lines_counted_depth_first() {
        let doc = sample();
        // lines: 0 heading, 1 paragraph, 2..=4 list items, 5 code block
        let pos = coordinate_to_position(&doc, DocumentPosition::new(5, 3)).unwrap();
        assert_eq!(position_to_coordinate(&doc, pos), DocumentPosition::new(5, 3));
        let empty_item = coordinate_to_position(&doc, DocumentPosition::new(3, 0)).unwrap();
        assert_eq!(position_to_coordinate(&doc, empty_item), DocumentPosition::new(3, 0));
    }

    #[test]
    fn test_stale_line_is_none() {
        let doc = sample();
        let lines = doc.line_count();
        assert_eq!(lines, 6);
        assert_eq!(coordinate_to_position(&doc, DocumentPosition::new(lines, 0)), None);
        assert_eq!(coordinate_to_position(&doc, DocumentPosition::new(lines + 10, 2)), None);
    }

    #[test]
    fn test_column_clamped_to_block() {
        let doc = Document::from_paragraphs(&["abc", "de"]);
        assert_eq!(coordinate_to_position(&doc, DocumentPosition::new(0, 99)), Some(4));
        assert_eq!(coordinate_to_position(&doc, DocumentPosition::new(1, 99)), Some(8));
    }

    #[test]
    fn test_offset_outside_blocks_falls_back_to_origin() {
        let doc = Document::from_paragraphs(&["ab", "cd"]);
        // 0 is before the first block, 4 sits between the blocks
        assert_eq!(position_to_coordinate(&doc, 0), DocumentPosition::ORIGIN);
        assert_eq!(position_to_coordinate(&doc, 4), DocumentPosition::ORIGIN);
        assert_eq!(position_to_coordinate(&doc, 500), DocumentPosition::ORIGIN);
        let empty = Document::new(Vec::new());
        assert_eq!(position_to_coordinate(&empty, 0), DocumentPosition::ORIGIN);
        assert_eq!(coordinate_to_position(&empty, DocumentPosition::ORIGIN), None);
    }

    #[test]
    fn test_wire_shape_accepts_ch() {
        let parsed: DocumentPosition = serde_json::from_str(r#"{"line":2,"ch":7}"#).unwrap();
        assert_eq!(parsed, DocumentPosition::new(2, 7));
        let json = serde_json::to_string(&DocumentPosition::new(1, 4)).unwrap();
        assert_eq!(json, r#"{"line":1,"column":4}"#);
    }
}
