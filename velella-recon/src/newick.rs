//! Newick format parsing shared by both tree types.
//!
//! Supports the standard Newick grammar:
//! ```text
//! tree     = subtree ';'
//! subtree  = '(' children ')' label | label
//! children = subtree (',' subtree)*
//! label    = name? (':' length)?
//! ```
//!
//! Parsing produces a neutral [`ParsedTree`] arena; [`crate::SpeciesTree`]
//! and [`crate::GeneTree`] build their own representations from it.

use velella_core::{Result, VelellaError};

/// A node of the raw parse arena.
#[derive(Debug, Clone)]
pub struct ParsedNode {
    /// Index of this node in the arena.
    pub id: usize,
    /// Parent node (None for root).
    pub parent: Option<usize>,
    /// Child nodes, in input order.
    pub children: Vec<usize>,
    /// Branch length from this node to its parent.
    pub length: Option<f64>,
    /// Node label (taxon name for leaves, support or clade name for inners).
    pub label: Option<String>,
}

impl ParsedNode {
    /// True if this node has no children.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// The result of parsing one Newick string.
#[derive(Debug, Clone)]
pub struct ParsedTree {
    /// All nodes; index 0 is always the root.
    pub nodes: Vec<ParsedNode>,
    /// Root node index.
    pub root: usize,
}

impl ParsedTree {
    /// Number of leaves.
    pub fn leaf_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_leaf()).count()
    }
}

/// Parse a Newick string.
pub fn parse(input: &str) -> Result<ParsedTree> {
    let mut cursor = Cursor::new(input.as_bytes());
    cursor.skip_whitespace();
    let root = cursor.parse_subtree(None)?;
    cursor.skip_whitespace();
    if cursor.peek() != Some(b';') {
        return Err(VelellaError::Parse(
            "expected ';' at end of Newick string".into(),
        ));
    }
    cursor.pos += 1;
    cursor.skip_whitespace();
    if cursor.pos != cursor.input.len() {
        return Err(VelellaError::Parse(
            "trailing characters after ';' in Newick string".into(),
        ));
    }
    Ok(ParsedTree {
        nodes: cursor.nodes,
        root,
    })
}

/// Format a branch length the way the writers expect: enough precision,
/// trailing zeros stripped.
pub(crate) fn format_length(length: f64) -> String {
    let formatted = format!("{:.10}", length);
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    trimmed.to_string()
}

struct Cursor<'a> {
    input: &'a [u8],
    pos: usize,
    nodes: Vec<ParsedNode>,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            pos: 0,
            nodes: Vec::new(),
        }
    }

    fn parse_subtree(&mut self, parent: Option<usize>) -> Result<usize> {
        self.skip_whitespace();
        let id = self.alloc(parent);

        if self.peek() == Some(b'(') {
            self.pos += 1;
            let first = self.parse_subtree(Some(id))?;
            self.nodes[id].children.push(first);
            loop {
                self.skip_whitespace();
                if self.peek() == Some(b',') {
                    self.pos += 1;
                    let child = self.parse_subtree(Some(id))?;
                    self.nodes[id].children.push(child);
                } else {
                    break;
                }
            }
            self.skip_whitespace();
            if self.peek() != Some(b')') {
                return Err(VelellaError::Parse("expected ')' in Newick string".into()));
            }
            self.pos += 1;
        }

        self.parse_label(id)?;
        Ok(id)
    }

    fn parse_label(&mut self, id: usize) -> Result<()> {
        self.skip_whitespace();
        let name = self.take_name();
        if !name.is_empty() {
            self.nodes[id].label = Some(name);
        }
        self.skip_whitespace();
        if self.peek() == Some(b':') {
            self.pos += 1;
            self.skip_whitespace();
            let raw = self.take_float();
            if raw.is_empty() {
                return Err(VelellaError::Parse("expected number after ':'".into()));
            }
            let length: f64 = raw
                .parse()
                .map_err(|_| VelellaError::Parse(format!("invalid branch length: '{}'", raw)))?;
            self.nodes[id].length = Some(length);
        }
        Ok(())
    }

    fn take_name(&mut self) -> String {
        let start = self.pos;
        while self.pos < self.input.len() {
            match self.input[self.pos] {
                b':' | b',' | b')' | b'(' | b';' => break,
                b' ' | b'\t' | b'\n' | b'\r' => break,
                _ => self.pos += 1,
            }
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    fn take_float(&mut self) -> String {
        let start = self.pos;
        while self.pos < self.input.len() {
            match self.input[self.pos] {
                b'0'..=b'9' | b'.' | b'-' | b'+' | b'e' | b'E' => self.pos += 1,
                _ => break,
            }
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    fn alloc(&mut self, parent: Option<usize>) -> usize {
        let id = self.nodes.len();
        self.nodes.push(ParsedNode {
            id,
            parent,
            children: Vec::new(),
            length: None,
            label: None,
        });
        id
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while self.pos < self.input.len() {
            match self.input[self.pos] {
                b' ' | b'\t' | b'\n' | b'\r' => self.pos += 1,
                _ => break,
            }
        }
    }
}
