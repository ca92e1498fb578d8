//! Source-location instrumentation for JSX/TSX files.
//!
//! Every markup element in a UI source file gets a
//! `data-agentation-location="<file>:<line>:<column>"` attribute naming the
//! position of its opening `<` in the original text, so the running
//! application can tell the toolbar exactly where an element was written.
//!
//! # Pipeline
//!
//! ```text
//! source text ──▶ tree-sitter (TSX) ──▶ MarkupVisitor ──▶ insertions
//!                                                            │
//!                         tagged text + Source Map v3 ◀──────┘
//! ```
//!
//! The transform only inserts text; every other byte of the input is
//! preserved, and all markers refer to positions in the input. Running the
//! transform on its own output changes nothing, because elements that
//! already carry the attribute are skipped.
//!
//! [`Locator`] wraps [`tag_source`] with the file filter (recognized
//! extensions, excluded dependency directories), the serve-only rule, and
//! fail-open error handling: a file that cannot be parsed is logged and
//! passed through untouched.

use std::fmt;
use std::path::{Path, PathBuf};

use agentation_core::models::{SourceLocation, LOCATION_ATTRIBUTE};
use anyhow::{Context, Result};
use globset::GlobSet;
use sourcemap::{SourceMap, SourceMapBuilder};
use tracing::{debug, warn};
use tree_sitter::{Node, Parser, Tree};

use crate::config::{build_globset, LocatorConfig};

/// Whether the host is serving for live development or producing a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    Serve,
    Build,
}

/// Result of instrumenting one file.
#[derive(Debug)]
pub struct TransformOutput {
    pub code: String,
    pub map: SourceMap,
    /// Number of elements that received a marker.
    pub tagged: usize,
}

impl TransformOutput {
    /// Serializes the source map as JSON.
    pub fn map_json(&self) -> Result<String> {
        let mut buf = Vec::new();
        self.map
            .to_writer(&mut buf)
            .context("Failed to serialize source map")?;
        Ok(String::from_utf8(buf)?)
    }
}

/// Why a file could not be instrumented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    /// The TSX grammar could not be loaded into the parser.
    Grammar(String),
    /// The parser gave up without producing a tree.
    Aborted,
    /// The file contains a syntax error at this 1-based line / 0-based column.
    Syntax { line: usize, column: usize },
}

impl fmt::Display for TransformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Grammar(msg) => write!(f, "failed to load TSX grammar: {}", msg),
            Self::Aborted => write!(f, "parser produced no syntax tree"),
            Self::Syntax { line, column } => {
                write!(f, "syntax error at line {}, column {}", line, column)
            }
        }
    }
}

impl std::error::Error for TransformError {}

/// File-level front end of the tagger.
pub struct Locator {
    root: PathBuf,
    extensions: Vec<String>,
    exclude: GlobSet,
}

impl Locator {
    pub fn new(config: &LocatorConfig) -> Result<Self> {
        Ok(Self {
            root: config
                .root
                .canonicalize()
                .unwrap_or_else(|_| config.root.clone()),
            extensions: config
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            exclude: build_globset(&config.all_exclude_globs())?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// True when `path` has a recognized extension and is not excluded.
    pub fn accepts(&self, path: &Path) -> bool {
        let ext_ok = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
            .unwrap_or(false);
        if !ext_ok {
            return false;
        }
        let relative = self.relative_path(path);
        !(self.exclude.is_match(&relative) || self.exclude.is_match(path))
    }

    /// Path relative to the project root, with `/` separators.
    pub fn relative_path(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        let relative = relative.strip_prefix(".").unwrap_or(relative);
        relative.to_string_lossy().replace('\\', "/")
    }

    /// Instruments `code` read from `path`.
    ///
    /// Returns `None` when the file is not eligible, when `mode` is
    /// [`BuildMode::Build`], or when the transform failed (the failure is
    /// logged and the caller keeps the original text).
    pub fn transform(&self, code: &str, path: &Path, mode: BuildMode) -> Option<TransformOutput> {
        if mode == BuildMode::Build || !self.accepts(path) {
            return None;
        }
        let file = self.relative_path(path);
        match tag_source(code, &file) {
            Ok(output) => {
                debug!(file = %file, tagged = output.tagged, "instrumented file");
                Some(output)
            }
            Err(e) => {
                warn!(file = %file, error = %e, "location tagging failed; passing file through");
                None
            }
        }
    }
}

/// Instruments one source text. `file` is the path embedded in markers.
pub fn tag_source(code: &str, file: &str) -> Result<TransformOutput, TransformError> {
    let tree = parse_tsx(code)?;
    let root = tree.root_node();
    if root.has_error() {
        let bad = first_error(root).unwrap_or(root);
        let pos = bad.start_position();
        return Err(TransformError::Syntax {
            line: pos.row + 1,
            column: pos.column,
        });
    }

    let mut visitor = LocationVisitor::new(file, code);
    walk_markup(root, code, &mut visitor);
    let mut insertions = visitor.insertions;
    insertions.sort_by_key(|i| i.offset);

    let mut out = String::with_capacity(code.len() + insertions.len() * 48);
    let mut cursor = 0;
    for ins in &insertions {
        out.push_str(&code[cursor..ins.offset]);
        out.push_str(&ins.text);
        cursor = ins.offset;
    }
    out.push_str(&code[cursor..]);

    Ok(TransformOutput {
        code: out,
        map: build_source_map(file, code, &insertions),
        tagged: insertions.len(),
    })
}

fn parse_tsx(code: &str) -> Result<Tree, TransformError> {
    let mut parser = Parser::new();
    let language: tree_sitter::Language = tree_sitter_typescript::LANGUAGE_TSX.into();
    parser
        .set_language(&language)
        .map_err(|e| TransformError::Grammar(e.to_string()))?;
    parser.parse(code, None).ok_or(TransformError::Aborted)
}

fn first_error(node: Node<'_>) -> Option<Node<'_>> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    let mut cursor = node.walk();
    let children: Vec<_> = node.children(&mut cursor).collect();
    children
        .into_iter()
        .filter(|c| c.has_error())
        .find_map(first_error)
}

// ============ Markup traversal ============

/// The markup node kinds the walker distinguishes.
enum Markup<'tree> {
    /// `<Name ...>` opening a `jsx_element`.
    Opening(Node<'tree>),
    /// `<Name ... />`.
    SelfClosing(Node<'tree>),
    /// `<>`, `<Fragment>`, `<React.Fragment>`: renders no DOM node.
    Fragment(Node<'tree>),
}

impl<'tree> Markup<'tree> {
    fn classify(node: Node<'tree>, source: &str) -> Option<Self> {
        let self_closing = match node.kind() {
            "jsx_opening_element" => false,
            "jsx_self_closing_element" => true,
            _ => return None,
        };
        let is_fragment = match node.child_by_field_name("name") {
            None => true,
            Some(name) => {
                let text = node_text(name, source);
                text == "Fragment" || text.ends_with(".Fragment")
            }
        };
        Some(if is_fragment {
            Self::Fragment(node)
        } else if self_closing {
            Self::SelfClosing(node)
        } else {
            Self::Opening(node)
        })
    }
}

/// One case per markup kind; the walker supplies the node, the visitor
/// holds the file name and source text it needs.
trait MarkupVisitor<'tree> {
    fn opening(&mut self, node: Node<'tree>);
    fn self_closing(&mut self, node: Node<'tree>);
    fn fragment(&mut self, _node: Node<'tree>) {}
}

/// Depth-first, pre-order walk over every node, dispatching markup nodes.
fn walk_markup<'tree>(root: Node<'tree>, source: &str, visitor: &mut impl MarkupVisitor<'tree>) {
    let mut cursor = root.walk();
    loop {
        let node = cursor.node();
        match Markup::classify(node, source) {
            Some(Markup::Opening(n)) => visitor.opening(n),
            Some(Markup::SelfClosing(n)) => visitor.self_closing(n),
            Some(Markup::Fragment(n)) => visitor.fragment(n),
            None => {}
        }

        if cursor.goto_first_child() {
            continue;
        }
        loop {
            if cursor.goto_next_sibling() {
                break;
            }
            if !cursor.goto_parent() {
                return;
            }
        }
    }
}

struct Insertion {
    offset: usize,
    text: String,
}

/// Collects one marker insertion per eligible element.
struct LocationVisitor<'a> {
    file: &'a str,
    source: &'a str,
    insertions: Vec<Insertion>,
}

impl<'a> LocationVisitor<'a> {
    fn new(file: &'a str, source: &'a str) -> Self {
        Self {
            file,
            source,
            insertions: Vec::new(),
        }
    }

    fn tag(&mut self, node: Node<'_>) {
        if has_location_attribute(node, self.source) {
            return;
        }
        let start = node.start_position();
        let line_start = node.start_byte() - start.column;
        let column = utf16_len(&self.source[line_start..node.start_byte()]);
        let location = SourceLocation::new(self.file, (start.row + 1) as u32, column);

        self.insertions.push(Insertion {
            offset: attribute_insert_offset(node),
            text: format!(
                " {}=\"{}\"",
                LOCATION_ATTRIBUTE,
                escape_attribute(&location.to_string())
            ),
        });
    }
}

impl<'tree> MarkupVisitor<'tree> for LocationVisitor<'_> {
    fn opening(&mut self, node: Node<'tree>) {
        self.tag(node);
    }

    fn self_closing(&mut self, node: Node<'tree>) {
        self.tag(node);
    }
}

fn node_text<'s>(node: Node<'_>, source: &'s str) -> &'s str {
    &source[node.start_byte()..node.end_byte()]
}

fn has_location_attribute(element: Node<'_>, source: &str) -> bool {
    let mut cursor = element.walk();
    let found = element
        .named_children(&mut cursor)
        .filter(|c| c.kind() == "jsx_attribute")
        .any(|attr| {
            attr.named_child(0)
                .map(|name| node_text(name, source) == LOCATION_ATTRIBUTE)
                .unwrap_or(false)
        });
    found
}

/// Just after the last attribute, or after the tag name when there are none.
fn attribute_insert_offset(element: Node<'_>) -> usize {
    let mut cursor = element.walk();
    let last = element
        .named_children(&mut cursor)
        .filter(|c| c.kind() != "comment")
        .map(|c| c.end_byte())
        .max();
    last.unwrap_or(element.start_byte() + 1)
}

fn escape_attribute(value: &str) -> String {
    value.replace('&', "&amp;").replace('"', "&quot;")
}

fn utf16_len(s: &str) -> u32 {
    s.encode_utf16().count() as u32
}

/// Maps every output line start and every post-insertion position back to
/// the input. Insertions never contain newlines, so line numbers agree.
fn build_source_map(file: &str, source: &str, insertions: &[Insertion]) -> SourceMap {
    let mut builder = SourceMapBuilder::new(Some(file));
    let mut pending = insertions.iter().peekable();
    let mut line_start = 0;

    for (row, line) in source.split('\n').enumerate() {
        let row = row as u32;
        let line_end = line_start + line.len();
        builder.add(row, 0, row, 0, Some(file), None, false);

        let mut shift = 0;
        while let Some(ins) = pending.next_if(|i| i.offset <= line_end) {
            let src_col = utf16_len(&source[line_start..ins.offset]);
            shift += utf16_len(&ins.text);
            builder.add(row, src_col + shift, row, src_col, Some(file), None, false);
        }
        line_start = line_end + 1;
    }

    builder.into_sourcemap()
}
