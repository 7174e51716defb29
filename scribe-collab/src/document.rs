//! Rich-text document tree in the editor's JSON shape.
//!
//! ```text
//! doc
//! ├── heading        ── "Title"
//! ├── paragraph      ── "Hello " [bold]"world"
//! └── bulletList
//!     └── listItem
//!         └── paragraph ── "item"
//! ```
//!
//! Positions are offsets into the root's content. Every non-leaf node
//! contributes an opening and a closing token, text contributes one unit
//! per char and atoms (`hardBreak`, `image`, ...) a single unit, so the
//! content of a text block starting at `p` spans `p + 1 ..= p + 1 + size`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EditError;

/// Block types whose content is inline text. Each one is a "line".
pub const TEXTBLOCK_TYPES: &[&str] = &["paragraph", "heading", "codeBlock"];

/// Leaf node types that occupy a single position.
pub const ATOM_TYPES: &[&str] = &["hardBreak", "horizontalRule", "image"];

/// Inline formatting mark (bold, italic, link, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mark {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attrs: Map<String, Value>,
}

/// A node of the document tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attrs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<Node>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub marks: Vec<Mark>,
}

/// Traversal control returned by [`Document::descendants`] callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// Visit this node's children next
    Descend,
    /// Continue with the next sibling
    SkipChildren,
    /// End the traversal
    Stop,
}

impl Node {
    /// Block node with the given children.
    pub fn block(kind: impl Into<String>, content: Vec<Node>) -> Self {
        Self {
            kind: kind.into(),
            attrs: Map::new(),
            content,
            text: None,
            marks: Vec::new(),
        }
    }

    /// Plain text leaf.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            attrs: Map::new(),
            content: Vec::new(),
            text: Some(text.into()),
            marks: Vec::new(),
        }
    }

    /// Paragraph holding `text` (no children when empty).
    pub fn paragraph(text: &str) -> Self {
        Self::block("paragraph", inline(text))
    }

    pub fn heading(level: u8, text: &str) -> Self {
        let mut node = Self::block("heading", inline(text));
        node.attrs.insert("level".to_string(), Value::from(level));
        node
    }

    pub fn code_block(text: &str) -> Self {
        Self::block("codeBlock", inline(text))
    }

    /// `bulletList > listItem > paragraph` for each item.
    pub fn bullet_list(items: &[&str]) -> Self {
        let items = items
            .iter()
            .map(|item| Self::block("listItem", vec![Self::paragraph(item)]))
            .collect();
        Self::block("bulletList", items)
    }

    pub fn hard_break() -> Self {
        Self::block("hardBreak", Vec::new())
    }

    pub fn with_mark(mut self, kind: impl Into<String>) -> Self {
        self.marks.push(Mark {
            kind: kind.into(),
            attrs: Map::new(),
        });
        self
    }

    pub fn is_text(&self) -> bool {
        self.kind == "text"
    }

    pub fn is_textblock(&self) -> bool {
        TEXTBLOCK_TYPES.contains(&self.kind.as_str())
    }

    pub fn is_atom(&self) -> bool {
        ATOM_TYPES.contains(&self.kind.as_str())
    }

    pub fn is_leaf(&self) -> bool {
        self.is_text() || self.is_atom()
    }

    /// Number of positions this node occupies in its parent.
    pub fn node_size(&self) -> usize {
        if self.is_text() {
            self.text.as_deref().map_or(0, |t| t.chars().count())
        } else if self.is_atom() {
            1
        } else {
            self.content_size() + 2
        }
    }

    /// Number of positions between the opening and closing token.
    pub fn content_size(&self) -> usize {
        self.content.iter().map(Node::node_size).sum()
    }

    /// Concatenated text of all descendant text nodes.
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        if let Some(text) = &self.text {
            out.push_str(text);
        }
        for child in &self.content {
            child.collect_text(out);
        }
    }
}

fn inline(text: &str) -> Vec<Node> {
    if text.is_empty() {
        Vec::new()
    } else {
        vec![Node::text(text)]
    }
}

/// A whole note: the `doc` root and everything below it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document {
    root: Node,
}

impl Default for Document {
    fn default() -> Self {
        Self::empty()
    }
}

impl Document {
    /// Document with the given top-level blocks.
    pub fn new(blocks: Vec<Node>) -> Self {
        Self {
            root: Node::block("doc", blocks),
        }
    }

    /// A fresh note: one empty paragraph.
    pub fn empty() -> Self {
        Self::new(vec![Node::paragraph("")])
    }

    /// One paragraph per string.
    pub fn from_paragraphs(paragraphs: &[&str]) -> Self {
        Self::new(paragraphs.iter().map(|p| Node::paragraph(p)).collect())
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn blocks(&self) -> &[Node] {
        &self.root.content
    }

    /// Largest valid position.
    pub fn content_size(&self) -> usize {
        self.root.content_size()
    }

    /// Clamp a position into `0..=content_size`.
    pub fn clamp(&self, position: usize) -> usize {
        position.min(self.content_size())
    }

    /// Number of text blocks, i.e. addressable lines.
    pub fn line_count(&self) -> usize {
        let mut lines = 0;
        self.descendants(|node, _| {
            if node.is_textblock() {
                lines += 1;
                Visit::SkipChildren
            } else {
                Visit::Descend
            }
        });
        lines
    }

    /// Text of each line in document order.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        self.descendants(|node, _| {
            if node.is_textblock() {
                lines.push(node.text_content());
                Visit::SkipChildren
            } else {
                Visit::Descend
            }
        });
        lines
    }

    /// Depth-first walk calling `f(node, position)` for every node below
    /// the root, `position` being the offset just before the node.
    pub fn descendants<F>(&self, mut f: F)
    where
        F: FnMut(&Node, usize) -> Visit,
    {
        walk(&self.root.content, 0, &mut f);
    }

    /// Canonical JSON encoding. Attribute maps are ordered, so equal trees
    /// always serialize to identical bytes.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Byte-for-byte comparison of the serialized forms.
    pub fn same_serialized(&self, other: &Document) -> bool {
        match (self.to_json(), other.to_json()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    /// Insert `text` at `position`, which must lie inside a text block.
    pub fn insert_text(&mut self, position: usize, text: &str) -> Result<(), EditError> {
        let size = self.content_size();
        if position > size {
            return Err(EditError::OutOfRange { position, size });
        }
        if text.is_empty() {
            return Ok(());
        }
        let (block, start) = textblock_mut(&mut self.root.content, 0, position)
            .ok_or(EditError::NotInTextBlock(position))?;
        insert_inline(block, position - start, text);
        Ok(())
    }

    /// Remove `from..to`. Both ends must be inside the same text block.
    pub fn delete_range(&mut self, from: usize, to: usize) -> Result<(), EditError> {
        let size = self.content_size();
        if from > to || to > size {
            return Err(EditError::OutOfRange {
                position: from.max(to),
                size,
            });
        }
        if from == to {
            return Ok(());
        }
        let (block, start) = textblock_mut(&mut self.root.content, 0, from)
            .ok_or(EditError::NotInTextBlock(from))?;
        if to > start + block.content_size() {
            return Err(EditError::CrossesBlocks { from, to });
        }
        delete_inline(block, from - start, to - start);
        Ok(())
    }
}

fn walk<F>(nodes: &[Node], mut position: usize, f: &mut F) -> bool
where
    F: FnMut(&Node, usize) -> Visit,
{
    for node in nodes {
        match f(node, position) {
            Visit::Stop => return true,
            Visit::Descend if !node.is_leaf() => {
                if walk(&node.content, position + 1, f) {
                    return true;
                }
            }
            _ => {}
        }
        position += node.node_size();
    }
    false
}

/// Text block containing `position`, with the offset where its content starts.
fn textblock_mut(nodes: &mut [Node], base: usize, position: usize) -> Option<(&mut Node, usize)> {
    let mut offset = base;
    for node in nodes.iter_mut() {
        let size = node.node_size();
        if node.is_textblock() {
            let start = offset + 1;
            if position >= start && position <= start + node.content_size() {
                return Some((node, start));
            }
        } else if !node.is_leaf() && position > offset && position < offset + size {
            return textblock_mut(&mut node.content, offset + 1, position);
        }
        offset += size;
    }
    None
}

fn insert_inline(block: &mut Node, column: usize, text: &str) {
    let mut offset = 0;
    for index in 0..block.content.len() {
        let child = &mut block.content[index];
        let size = child.node_size();
        if child.is_text() && column <= offset + size {
            let existing = child.text.get_or_insert_with(String::new);
            let at = byte_index(existing, column - offset);
            existing.insert_str(at, text);
            return;
        }
        if column <= offset {
            block.content.insert(index, Node::text(text));
            return;
        }
        offset += size;
    }
    block.content.push(Node::text(text));
}

fn delete_inline(block: &mut Node, from: usize, to: usize) {
    let mut offset = 0;
    let mut kept = Vec::with_capacity(block.content.len());
    for mut child in std::mem::take(&mut block.content) {
        let size = child.node_size();
        let (start, end) = (offset, offset + size);
        offset = end;
        if end <= from || start >= to {
            kept.push(child);
            continue;
        }
        if child.is_text() {
            let remaining: String = child
                .text
                .as_deref()
                .unwrap_or_default()
                .chars()
                .enumerate()
                .filter(|(i, _)| start + i < from || start + i >= to)
                .map(|(_, c)| c)
                .collect();
            if !remaining.is_empty() {
                child.text = Some(remaining);
                kept.push(child);
            }
        }
    }
    block.content = kept;
}

fn byte_index(s: &str, chars: usize) -> usize {
    s.char_indices().nth(chars).map_or(s.len(), |(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Document {
        Document::new(vec![
            Node::heading(1, "Title"),
            Node::paragraph("Hello"),
            Node::bullet_list(&["one", "two"]),
        ])
    }

    #[test]
    fn test_sizes() {
        let doc = Document::from_paragraphs(&["Hello", "World"]);
        assert_eq!(doc.blocks()[0].node_size(), 7);
        assert_eq!(doc.content_size(), 14);
        assert_eq!(Document::empty().content_size(), 2);
    }

    #[test]
    fn test_atom_counts_one() {
        let para = Node::block(
            "paragraph",
            vec![Node::text("ab"), Node::hard_break(), Node::text("c")],
        );
        assert_eq!(para.content_size(), 4);
    }

    #[test]
    fn test_line_count_nested() {
        let doc = sample();
        assert_eq!(doc.line_count(), 4);
        assert_eq!(doc.lines(), vec!["Title", "Hello", "one", "two"]);
    }

    #[test]
    fn test_descendants_positions() {
        let doc = Document::from_paragraphs(&["ab", "cd"]);
        let mut seen = Vec::new();
        doc.descendants(|node, pos| {
            if node.is_textblock() {
                seen.push(pos);
            }
            Visit::Descend
        });
        assert_eq!(seen, vec![0, 4]);
    }

    #[test]
    fn test_descendants_stop() {
        let doc = sample();
        let mut visited = 0;
        doc.descendants(|_, _| {
            visited += 1;
            Visit::Stop
        });
        assert_eq!(visited, 1);
    }

    #[test]
    fn test_json_shape() {
        let doc = Document::from_paragraphs(&["Hi"]);
        let json = doc.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"type":"doc","content":[{"type":"paragraph","content":[{"type":"text","text":"Hi"}]}]}"#
        );
        let parsed = Document::from_json(&json).unwrap();
        assert!(parsed.same_serialized(&doc));
    }

    #[test]
    fn test_insert_text_middle() {
        let mut doc = Document::from_paragraphs(&["Hello", "World"]);
        // "Hello" content starts at 1, so 3 is between "He" and "llo"
        doc.insert_text(3, "XY").unwrap();
        assert_eq!(doc.lines(), vec!["HeXYllo", "World"]);
        doc.insert_text(doc.content_size() - 1, "!").unwrap();
        assert_eq!(doc.lines()[1], "World!");
    }

    #[test]
    fn test_insert_into_empty_block() {
        let mut doc = Document::empty();
        doc.insert_text(1, "first").unwrap();
        assert_eq!(doc.lines(), vec!["first"]);
    }

    #[test]
    fn test_insert_nested_list_item() {
        let mut doc = sample();
        let mut target = None;
        doc.descendants(|node, pos| {
            if node.is_textblock() && node.text_content() == "two" {
                target = Some(pos + 1);
                return Visit::Stop;
            }
            Visit::Descend
        });
        doc.insert_text(target.unwrap(), "> ").unwrap();
        assert_eq!(doc.lines()[3], "> two");
    }

    #[test]
    fn test_insert_between_blocks_rejected() {
        let mut doc = Document::from_paragraphs(&["ab", "cd"]);
        // 4 is the boundary between the two paragraphs
        assert_eq!(
            doc.insert_text(4, "x"),
            Err(EditError::NotInTextBlock(4))
        );
        assert!(matches!(
            doc.insert_text(99, "x"),
            Err(EditError::OutOfRange { position: 99, .. })
        ));
    }

    #[test]
    fn test_insert_before_atom() {
        let mut doc = Document::new(vec![Node::block(
            "paragraph",
            vec![Node::hard_break(), Node::text("b")],
        )]);
        doc.insert_text(1, "a").unwrap();
        assert_eq!(doc.blocks()[0].content[0].text.as_deref(), Some("a"));
        assert_eq!(doc.blocks()[0].content_size(), 3);
    }

    #[test]
    fn test_delete_range_across_text_nodes() {
        let mut doc = Document::new(vec![Node::block(
            "paragraph",
            vec![Node::text("Hello "), Node::text("world").with_mark("bold")],
        )]);
        // delete "lo wo"
        doc.delete_range(4, 9).unwrap();
        assert_eq!(doc.lines(), vec!["Helrld"]);
        assert_eq!(doc.blocks()[0].content[1].marks[0].kind, "bold");
    }

    #[test]
    fn test_delete_whole_text_drops_node() {
        let mut doc = Document::from_paragraphs(&["abc"]);
        doc.delete_range(1, 4).unwrap();
        assert!(doc.blocks()[0].content.is_empty());
        assert_eq!(doc.content_size(), 2);
    }

    #[test]
    fn test_delete_across_blocks_rejected() {
        let mut doc = Document::from_paragraphs(&["ab", "cd"]);
        assert_eq!(
            doc.delete_range(2, 6),
            Err(EditError::CrossesBlocks { from: 2, to: 6 })
        );
        assert_eq!(doc.lines(), vec!["ab", "cd"]);
    }

    #[test]
    fn test_unicode_columns() {
        let mut doc = Document::from_paragraphs(&["héllo"]);
        assert_eq!(doc.content_size(), 7);
        doc.insert_text(3, "-").unwrap();
        assert_eq!(doc.lines(), vec!["hé-llo"]);
    }
}
