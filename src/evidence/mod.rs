//! Source evidence for adjudication
//!
//! Maps the `file:line:` frames of an error trace to the smallest enclosing
//! declaration in the checked-out sources, and resolves functions or macros the
//! model asks to see. Nothing here is fatal: a missing file or an unparsable
//! source yields less evidence, never an error.

pub mod flags;
pub mod parser;
pub mod resolve;

pub use flags::BuildFlags;
pub use parser::{LineSpan, SourceCache, SourceFile};
pub use resolve::{LexicalResolver, ResolvedSymbol, SemanticResolver, SymbolResolver};

use crate::config::RepositoryConfig;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

static TRACE_LOCATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([^\s]+\.(?:c|h)):(\d+):").unwrap_or_else(|_| unreachable!())
});

/// The model's request to see the implementation of a function or macro.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingSymbolRequest {
    #[serde(rename = "expression_name")]
    pub name: String,
    #[serde(rename = "referring_source_code_path", default)]
    pub referring_file: String,
    #[serde(rename = "recommendation", default)]
    pub rationale: String,
}

/// Line-numbered excerpts keyed by repository-relative file path.
///
/// Excerpts keep first-seen order within a file and are never duplicated;
/// evidence only grows as rounds add to it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EvidenceSet {
    files: BTreeMap<String, Vec<String>>,
}

impl EvidenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an excerpt. Returns false when it was already present.
    pub fn add(&mut self, file: impl Into<String>, excerpt: String) -> bool {
        if excerpt.trim().is_empty() {
            return false;
        }
        let excerpts = self.files.entry(file.into()).or_default();
        if excerpts.contains(&excerpt) {
            return false;
        }
        excerpts.push(excerpt);
        true
    }

    /// Merge `other` in. Returns the number of excerpts that were new.
    pub fn extend(&mut self, other: EvidenceSet) -> usize {
        let mut added = 0;
        for (file, excerpts) in other.files {
            for excerpt in excerpts {
                if self.add(file.clone(), excerpt) {
                    added += 1;
                }
            }
        }
        added
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn excerpt_count(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }

    pub fn excerpts(&self, file: &str) -> Option<&[String]> {
        self.files.get(file).map(Vec::as_slice)
    }

    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// Prompt rendering: one `code of <file> file:` block per file.
    pub fn render(&self) -> String {
        self.files
            .iter()
            .map(|(file, excerpts)| format!("code of {} file:\n{}", file, excerpts.join("\n")))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// `(file, line)` pairs cited by an error trace, in order of appearance, without repeats.
pub fn cited_locations(trace: &str) -> Vec<(String, usize)> {
    let mut seen = Vec::new();
    for caps in TRACE_LOCATION.captures_iter(trace) {
        let (Some(file), Some(line)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        let Ok(line) = line.as_str().parse::<usize>() else {
            continue;
        };
        let location = (file.as_str().to_string(), line);
        if line > 0 && !seen.contains(&location) {
            seen.push(location);
        }
    }
    seen
}

pub struct EvidenceExtractor {
    root: PathBuf,
    report_prefix: String,
    context_window: usize,
    cache: Arc<SourceCache>,
    resolvers: Vec<Box<dyn SymbolResolver>>,
}

impl EvidenceExtractor {
    /// Build an extractor with the default resolver chain (semantic, then
    /// lexical). Fails only if configured build-flag files cannot be read.
    pub fn new(repo: &RepositoryConfig) -> anyhow::Result<Self> {
        let cache = Arc::new(SourceCache::new());
        let flags = Arc::new(BuildFlags::new(
            &repo.root,
            repo.compile_commands.as_deref(),
            repo.forced_include.as_deref(),
        )?);
        let resolvers: Vec<Box<dyn SymbolResolver>> = vec![
            Box::new(SemanticResolver::new(cache.clone(), flags)),
            Box::new(LexicalResolver::new(&repo.root, cache.clone())),
        ];
        Ok(Self::with_resolvers(repo, cache, resolvers))
    }

    pub fn with_resolvers(
        repo: &RepositoryConfig,
        cache: Arc<SourceCache>,
        resolvers: Vec<Box<dyn SymbolResolver>>,
    ) -> Self {
        Self {
            root: repo.root.clone(),
            report_prefix: repo.effective_report_prefix(),
            context_window: repo.context_window,
            cache,
            resolvers,
        }
    }

    pub fn cache(&self) -> &SourceCache {
        &self.cache
    }

    /// Evidence for every location an error trace cites.
    pub fn extract_from_trace(&self, trace: &str) -> EvidenceSet {
        let mut evidence = EvidenceSet::new();
        for (raw_path, line) in cited_locations(trace) {
            let relative = self.relative_path(&raw_path);
            let path = self.root.join(&relative);
            let Some(file) = self.cache.load(&path) else {
                tracing::debug!("Skipping missing file: {}", path.display());
                continue;
            };
            if let Some(excerpt) = self.excerpt_at(&file, line) {
                evidence.add(relative, excerpt);
            }
        }
        evidence
    }

    /// Enclosing declaration of `line`, or a fixed window around it.
    fn excerpt_at(&self, file: &SourceFile, line: usize) -> Option<String> {
        let span = match file.innermost_declaration(line) {
            Some(span) => span,
            None => {
                tracing::info!("No declaration encloses {}:{}; using a window", file.path.display(), line);
                file.window(line, self.context_window)?
            }
        };
        Some(file.render(span))
    }

    /// Fetch the implementations the model asked for, trying each resolver in turn.
    pub fn resolve_missing(&self, requests: &[MissingSymbolRequest]) -> EvidenceSet {
        let mut by_file: BTreeMap<String, Vec<&str>> = BTreeMap::new();
        for request in requests {
            let name = request.name.trim();
            if name.is_empty() {
                continue;
            }
            let names = by_file.entry(self.relative_path(&request.referring_file)).or_default();
            if !names.contains(&name) {
                names.push(name);
            }
        }

        let mut evidence = EvidenceSet::new();
        for (relative, names) in by_file {
            let referring = self.root.join(&relative);
            for name in names {
                let resolved = self.resolvers.iter().find_map(|resolver| {
                    let found = resolver.resolve(&referring, name)?;
                    tracing::debug!(resolver = resolver.name(), "Resolved {} in {}", name, found.file.display());
                    Some(found)
                });
                let Some(found) = resolved else {
                    tracing::info!("Missing source code of {} (referenced from {})", name, relative);
                    continue;
                };
                if let Some(file) = self.cache.load(&found.file) {
                    evidence.add(self.display_path(&found.file), file.render(found.span));
                }
            }
        }
        evidence
    }

    /// Strip the checkout root, the report prefix and any `:line` suffix.
    fn relative_path(&self, raw: &str) -> String {
        let root = self.root.to_string_lossy();
        let mut path = raw.trim();
        path = path.strip_prefix(root.as_ref()).unwrap_or(path);
        path = path.trim_start_matches('/');
        if !self.report_prefix.is_empty() {
            path = path.strip_prefix(self.report_prefix.as_str()).unwrap_or(path);
        }
        path = path.split(':').next().unwrap_or(path);
        path.trim_start_matches("./").to_string()
    }

    fn display_path(&self, path: &Path) -> String {
        let normalized = flags::normalize(path);
        let root = flags::normalize(&self.root);
        normalized
            .strip_prefix(&root)
            .unwrap_or(&normalized)
            .to_string_lossy()
            .to_string()
    }
}
