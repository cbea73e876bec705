//! Missing-symbol resolution strategies
//!
//! The adjudicator asks for implementations of functions and macros it could
//! not see. Resolution is tried in order: a semantic pass over the referring
//! file's translation unit, then a repository-wide lexical search for cases
//! where the build flags are incomplete and the definition sits outside what
//! the semantic pass can reach.

use super::flags::{normalize, BuildFlags};
use super::parser::{declared_name, walk_preorder, LineSpan, SourceCache, SourceFile};
use rayon::prelude::*;
use regex::Regex;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tree_sitter::Node;
use walkdir::WalkDir;

/// Upper bound on files pulled into one translation unit.
const MAX_UNIT_FILES: usize = 256;

/// Where a symbol's definition lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSymbol {
    pub file: PathBuf,
    pub span: LineSpan,
}

pub trait SymbolResolver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Locate the definition of `symbol` as used from `referring_file`.
    fn resolve(&self, referring_file: &Path, symbol: &str) -> Option<ResolvedSymbol>;
}

// ═══════════════════════════════════════════════════════════════════════════
//  SEMANTIC
// ═══════════════════════════════════════════════════════════════════════════

/// Follows a use of the symbol in the referring file to its definition within
/// the file's translation unit (the file, its includes, and the forced include).
pub struct SemanticResolver {
    cache: Arc<SourceCache>,
    flags: Arc<BuildFlags>,
}

impl SemanticResolver {
    pub fn new(cache: Arc<SourceCache>, flags: Arc<BuildFlags>) -> Self {
        Self { cache, flags }
    }

    /// The referring file first, then its includes breadth-first, then the
    /// forced include.
    fn translation_unit(&self, file: &SourceFile) -> Vec<Arc<SourceFile>> {
        let mut unit = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([normalize(&file.path)]);
        let flags = self.flags.for_file(&file.path, file.content());

        while let Some(path) = queue.pop_front() {
            if unit.len() >= MAX_UNIT_FILES {
                tracing::debug!("Translation unit of {} truncated", file.path.display());
                break;
            }
            if !seen.insert(path.clone()) {
                continue;
            }
            let Some(source) = self.cache.load(&path) else {
                continue;
            };
            for include in active_includes(&source, &flags.defines) {
                if let Some(found) = locate_include(&path, &include, &flags.include_dirs) {
                    queue.push_back(found);
                }
            }
            unit.push(source);
        }

        if let Some(forced) = self.flags.forced_include() {
            if seen.insert(normalize(forced)) {
                if let Some(source) = self.cache.load(forced) {
                    unit.push(source);
                }
            }
        }
        unit
    }
}

impl SymbolResolver for SemanticResolver {
    fn name(&self) -> &'static str {
        "semantic"
    }

    fn resolve(&self, referring_file: &Path, symbol: &str) -> Option<ResolvedSymbol> {
        let file = self.cache.load(referring_file)?;
        let use_line = find_use_site(&file, symbol)?;
        tracing::debug!("{} used at {}:{}", symbol, referring_file.display(), use_line);

        self.translation_unit(&file).iter().find_map(|source| {
            find_definition(source, symbol).map(|span| ResolvedSymbol {
                file: source.path.clone(),
                span,
            })
        })
    }
}

/// First line where `symbol` is called or expanded.
fn find_use_site(file: &SourceFile, symbol: &str) -> Option<usize> {
    let root = file.root()?;
    let source = file.content().as_bytes();
    let mut found = None;
    walk_preorder(root, |node, _| {
        if found.is_some() {
            return false;
        }
        let is_use = match node.kind() {
            "call_expression" => node
                .child_by_field_name("function")
                .and_then(|f| f.utf8_text(source).ok())
                .is_some_and(|name| name == symbol),
            "identifier" | "type_identifier" => {
                node.utf8_text(source).is_ok_and(|name| name == symbol)
            }
            _ => false,
        };
        if is_use {
            found = Some(node.start_position().row + 1);
        }
        true
    });
    found
}

/// Span of a function or macro definition of `symbol` in `file`.
fn find_definition(file: &SourceFile, symbol: &str) -> Option<LineSpan> {
    let root = file.root()?;
    let source = file.content();
    let mut found = None;
    walk_preorder(root, |node, _| {
        if found.is_some() {
            return false;
        }
        let name = match node.kind() {
            "function_definition" => declared_name(&node, source),
            "preproc_def" | "preproc_function_def" => node
                .child_by_field_name("name")
                .and_then(|n| n.utf8_text(source.as_bytes()).ok()),
            _ => None,
        };
        if name == Some(symbol) {
            found = Some(LineSpan::of_node(&node));
            return false;
        }
        // Definitions never nest inside function bodies
        node.kind() != "function_definition"
    });
    found
}

/// `#include` targets that are active given `defines`. `#ifdef`/`#ifndef`
/// branches are followed according to the flags; other conditionals are
/// followed on every branch.
fn active_includes(file: &SourceFile, defines: &BTreeSet<String>) -> Vec<String> {
    let Some(root) = file.root() else {
        return Vec::new();
    };
    let source = file.content().as_bytes();
    let mut includes = Vec::new();
    collect_includes(root, source, defines, &mut includes);
    includes
}

fn collect_includes(
    node: Node,
    source: &[u8],
    defines: &BTreeSet<String>,
    out: &mut Vec<String>,
) {
    match node.kind() {
        "preproc_include" => {
            if let Some(path) = node
                .child_by_field_name("path")
                .and_then(|p| p.utf8_text(source).ok())
            {
                out.push(path.trim_matches(|c| c == '"' || c == '<' || c == '>').to_string());
            }
        }
        "preproc_ifdef" => {
            let negated = node.child(0).is_some_and(|c| c.kind() == "#ifndef");
            let defined = node
                .child_by_field_name("name")
                .and_then(|n| n.utf8_text(source).ok())
                .is_some_and(|name| defines.contains(name));
            let taken = defined != negated;
            let alternative = node.child_by_field_name("alternative").map(|a| a.id());
            let name = node.child_by_field_name("name").map(|n| n.id());
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                if Some(child.id()) == name {
                    continue;
                }
                let is_alternative = Some(child.id()) == alternative;
                if is_alternative != taken {
                    collect_includes(child, source, defines, out);
                }
            }
        }
        "function_definition" => {}
        _ => {
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                collect_includes(child, source, defines, out);
            }
        }
    }
}

fn locate_include(from: &Path, include: &str, include_dirs: &[PathBuf]) -> Option<PathBuf> {
    from.parent()
        .into_iter()
        .chain(include_dirs.iter().map(PathBuf::as_path))
        .map(|dir| normalize(&dir.join(include)))
        .find(|candidate| candidate.is_file())
}

// ═══════════════════════════════════════════════════════════════════════════
//  LEXICAL
// ═══════════════════════════════════════════════════════════════════════════

/// Repository-wide pattern search. The first match in sorted path order wins,
/// so results do not depend on scan parallelism.
pub struct LexicalResolver {
    root: PathBuf,
    cache: Arc<SourceCache>,
    files: OnceLock<Vec<PathBuf>>,
}

impl LexicalResolver {
    pub fn new(root: &Path, cache: Arc<SourceCache>) -> Self {
        Self {
            root: root.to_path_buf(),
            cache,
            files: OnceLock::new(),
        }
    }

    fn source_files(&self) -> &[PathBuf] {
        self.files.get_or_init(|| {
            WalkDir::new(&self.root)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'))
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path())
                .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("c" | "h")))
                .collect()
        })
    }

    fn search(
        &self,
        pattern: &Regex,
        to_span: impl Fn(&SourceFile, usize) -> Option<LineSpan> + Sync,
    ) -> Option<ResolvedSymbol> {
        self.source_files().par_iter().find_map_first(|path| {
            let file = self.cache.load(path)?;
            file.content()
                .lines()
                .enumerate()
                .filter(|(_, text)| pattern.is_match(text))
                .find_map(|(i, _)| to_span(&*file, i + 1))
                .map(|span| ResolvedSymbol {
                    file: path.clone(),
                    span,
                })
        })
    }
}

/// Lines that look like the start of a definition of function `name`.
pub(crate) fn function_signature_pattern(name: &str) -> Option<Regex> {
    Regex::new(&format!(
        r"^(?:[A-Za-z_][A-Za-z0-9_\s\*]*[\s\*])?{}\s*\([^;{{]*(?:\)\s*\{{?\s*)?$",
        regex::escape(name)
    ))
    .ok()
}

/// `#define name` lines.
pub(crate) fn macro_definition_pattern(name: &str) -> Option<Regex> {
    Regex::new(&format!(r"^\s*#\s*define\s+{}\b", regex::escape(name))).ok()
}

impl SymbolResolver for LexicalResolver {
    fn name(&self) -> &'static str {
        "lexical"
    }

    fn resolve(&self, _referring_file: &Path, symbol: &str) -> Option<ResolvedSymbol> {
        let function = function_signature_pattern(symbol)?;
        if let Some(found) = self.search(&function, |file, line| file.innermost_declaration(line)) {
            return Some(found);
        }
        let define = macro_definition_pattern(symbol)?;
        self.search(&define, |file, line| file.continued_span(line))
    }
}
