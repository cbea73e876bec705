//! Tree-sitter C parsing and per-file source cache

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tree_sitter::{Node, Parser, Tree};

// ═══════════════════════════════════════════════════════════════════════════
//  THREAD-LOCAL PARSER
// ═══════════════════════════════════════════════════════════════════════════
//
// Parsers are costly to set up and cheap to reuse. Each thread (including
// rayon workers during lexical scans) keeps its own configured C parser.

thread_local! {
    static C_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        if let Err(e) = p.set_language(&tree_sitter_c::LANGUAGE.into()) {
            tracing::warn!("C grammar rejected by tree-sitter runtime: {}", e);
        }
        p
    });
}

fn parse_c(content: &str) -> anyhow::Result<Tree> {
    C_PARSER
        .with(|p| p.borrow_mut().parse(content, None))
        .ok_or_else(|| anyhow::anyhow!("Failed to parse C source"))
}

/// Node kinds that count as an enclosing declaration for an excerpt.
const DECLARATION_KINDS: &[&str] = &[
    "function_definition",
    "struct_specifier",
    "union_specifier",
    "enum_specifier",
];

/// An inclusive, 1-based line range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSpan {
    pub start: usize,
    pub end: usize,
}

impl LineSpan {
    pub fn contains(&self, line: usize) -> bool {
        self.start <= line && line <= self.end
    }

    /// Lines spanned by `node`. A node ending at column 0 stops on the previous line.
    pub(crate) fn of_node(node: &Node) -> Self {
        let start = node.start_position().row;
        let end_pos = node.end_position();
        let end = if end_pos.column == 0 && end_pos.row > start {
            end_pos.row - 1
        } else {
            end_pos.row
        };
        Self {
            start: start + 1,
            end: end + 1,
        }
    }
}

fn is_declaration(node: &Node) -> bool {
    let kind = node.kind();
    if !DECLARATION_KINDS.contains(&kind) {
        return false;
    }
    // A bare `struct foo` reference is a type use, not a declaration
    match kind {
        "struct_specifier" | "union_specifier" | "enum_specifier" => {
            node.child_by_field_name("body").is_some()
        }
        _ => true,
    }
}

/// Pre-order walk that tracks depth. `visit` returns false to skip a subtree.
pub(crate) fn walk_preorder<'t>(root: Node<'t>, mut visit: impl FnMut(Node<'t>, usize) -> bool) {
    let mut cursor = root.walk();
    let mut depth = 0usize;
    loop {
        let node = cursor.node();
        if visit(node, depth) && cursor.goto_first_child() {
            depth += 1;
            continue;
        }
        loop {
            if cursor.goto_next_sibling() {
                break;
            }
            if !cursor.goto_parent() {
                return;
            }
            depth -= 1;
        }
    }
}

/// Find the deepest declaration whose line extent contains `line` (1-based).
pub(crate) fn innermost_declaration(root: Node, line: usize) -> Option<LineSpan> {
    let row = line.checked_sub(1)?;
    let mut best: Option<(usize, LineSpan)> = None;
    walk_preorder(root, |node, depth| {
        let contains = node.start_position().row <= row && row <= node.end_position().row;
        if contains && is_declaration(&node) && best.map_or(true, |(d, _)| depth > d) {
            best = Some((depth, LineSpan::of_node(&node)));
        }
        contains
    });
    best.map(|(_, span)| span)
}

/// Name declared by a function definition, following nested declarators
/// (`static char *foo(void)` -> `foo`).
pub(crate) fn declared_name<'s>(node: &Node, source: &'s str) -> Option<&'s str> {
    let mut current = node.child_by_field_name("declarator")?;
    loop {
        match current.kind() {
            "identifier" | "field_identifier" => return current.utf8_text(source.as_bytes()).ok(),
            "parenthesized_declarator" => current = current.named_child(0)?,
            _ => current = current.child_by_field_name("declarator")?,
        }
    }
}

/// A source file read once, with its syntax tree when parsing succeeded.
pub struct SourceFile {
    pub path: PathBuf,
    content: String,
    line_count: usize,
    tree: Option<Tree>,
}

impl SourceFile {
    pub fn new(path: PathBuf, content: String) -> Self {
        let tree = match parse_c(&content) {
            Ok(tree) => Some(tree),
            Err(e) => {
                tracing::debug!("{}: {}", path.display(), e);
                None
            }
        };
        let line_count = content.lines().count();
        Self {
            path,
            content,
            line_count,
            tree,
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn line_count(&self) -> usize {
        self.line_count
    }

    pub fn root(&self) -> Option<Node<'_>> {
        self.tree.as_ref().map(|t| t.root_node())
    }

    pub fn innermost_declaration(&self, line: usize) -> Option<LineSpan> {
        innermost_declaration(self.root()?, line)
    }

    /// `radius` lines either side of `line`, clamped to the file.
    pub fn window(&self, line: usize, radius: usize) -> Option<LineSpan> {
        if self.line_count == 0 {
            return None;
        }
        let center = line.clamp(1, self.line_count);
        Some(LineSpan {
            start: center.saturating_sub(radius).max(1),
            end: center.saturating_add(radius).min(self.line_count),
        })
    }

    /// Lines of `span`, each prefixed with its line number.
    pub fn render(&self, span: LineSpan) -> String {
        self.content
            .lines()
            .enumerate()
            .skip(span.start.saturating_sub(1))
            .take((span.end + 1).saturating_sub(span.start))
            .map(|(i, text)| format!("{}| {}", i + 1, text))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The line `line` and any `\` continuation lines after it.
    pub fn continued_span(&self, line: usize) -> Option<LineSpan> {
        if line == 0 || line > self.line_count {
            return None;
        }
        let mut end = line;
        for text in self.content.lines().skip(line - 1) {
            if !text.trim_end().ends_with('\\') || end >= self.line_count {
                break;
            }
            end += 1;
        }
        Some(LineSpan { start: line, end })
    }
}

/// Parsed files keyed by path. Parsing dominates extraction cost, so each
/// file is read and parsed at most once per run. Missing files are cached too.
#[derive(Default)]
pub struct SourceCache {
    files: Mutex<HashMap<PathBuf, Option<Arc<SourceFile>>>>,
}

impl SourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, path: &Path) -> Option<Arc<SourceFile>> {
        if let Some(cached) = self.lock().get(path) {
            return cached.clone();
        }
        let loaded = match fs::read(path) {
            Ok(bytes) => Some(Arc::new(SourceFile::new(
                path.to_path_buf(),
                String::from_utf8_lossy(&bytes).into_owned(),
            ))),
            Err(e) => {
                tracing::debug!("Cannot read {}: {}", path.display(), e);
                None
            }
        };
        self.lock()
            .entry(path.to_path_buf())
            .or_insert(loaded)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Option<Arc<SourceFile>>>> {
        self.files.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
