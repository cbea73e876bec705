//! Build flags for semantic resolution: include directories and macro
//! definitions per translation unit.
//!
//! Exact flags come from a `compile_commands.json` when one is configured.
//! Failing that, a forced-include header contributes its `#define`s, and as a
//! last resort every macro tested by an `#if`/`#ifdef`/`#ifndef` in the file is
//! assumed defined.

use anyhow::Context;
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

static CONDITIONAL_DIRECTIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*#\s*(?:if|ifdef|ifndef)\b(.*)$").unwrap_or_else(|_| unreachable!())
});

static CONDITIONAL_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"defined\s*\(\s*(\w+)\s*\)|defined\s+(\w+)|\b([A-Z_][A-Z0-9_]*)\b")
        .unwrap_or_else(|_| unreachable!())
});

static INCLUDE_GUARD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*#\s*ifndef\s+(\w+)[ \t]*\r?\n\s*#\s*define\s+(\w+)")
        .unwrap_or_else(|_| unreachable!())
});

static DEFINE_DIRECTIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*#\s*define\s+(\w+)").unwrap_or_else(|_| unreachable!())
});

#[derive(Deserialize)]
struct CompileCommandEntry {
    directory: PathBuf,
    file: PathBuf,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    arguments: Option<Vec<String>>,
}

/// Compiler invocation details for one source file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompileFlags {
    pub include_dirs: Vec<PathBuf>,
    pub defines: BTreeSet<String>,
}

/// `compile_commands.json` indexed by normalized absolute file path.
#[derive(Debug, Default)]
pub struct CompileCommands {
    by_file: HashMap<PathBuf, CompileFlags>,
}

impl CompileCommands {
    /// Load a compilation database. Entries for files that do not exist under
    /// `repo_root` are dropped; relative paths that climb out of the build
    /// directory are re-anchored at the repository root.
    pub fn load(path: &Path, repo_root: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read compile commands {}", path.display()))?;
        let entries: Vec<CompileCommandEntry> = serde_json::from_str(&content)
            .with_context(|| format!("{} is not a compilation database", path.display()))?;

        let mut by_file = HashMap::new();
        for entry in entries {
            let Some(file) = anchor(&entry.directory, &entry.file, repo_root) else {
                continue;
            };
            let args = match (entry.arguments, entry.command) {
                (Some(args), _) => args,
                (None, Some(command)) => command.split_whitespace().map(str::to_string).collect(),
                (None, None) => Vec::new(),
            };
            by_file.insert(file, parse_args(&args, &entry.directory, repo_root));
        }
        tracing::info!(files = by_file.len(), "Loaded compile commands from {}", path.display());
        Ok(Self { by_file })
    }

    pub fn get(&self, file: &Path) -> Option<&CompileFlags> {
        self.by_file.get(&normalize(file))
    }

    pub fn len(&self) -> usize {
        self.by_file.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_file.is_empty()
    }
}

fn anchor(directory: &Path, file: &Path, repo_root: &Path) -> Option<PathBuf> {
    let direct = normalize(&directory.join(file));
    if direct.exists() {
        return Some(direct);
    }
    let stripped: PathBuf = file
        .components()
        .skip_while(|c| matches!(c, Component::ParentDir | Component::CurDir))
        .collect();
    let rebased = normalize(&repo_root.join(stripped));
    rebased.exists().then_some(rebased)
}

fn parse_args(args: &[String], directory: &Path, repo_root: &Path) -> CompileFlags {
    let mut flags = CompileFlags::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let (kind, value) = if arg == "-I" || arg == "-D" || arg == "-isystem" {
            (arg.as_str(), iter.next().map(String::as_str))
        } else if let Some(rest) = arg.strip_prefix("-I") {
            ("-I", Some(rest))
        } else if let Some(rest) = arg.strip_prefix("-D") {
            ("-D", Some(rest))
        } else {
            continue;
        };
        let Some(value) = value.filter(|v| !v.is_empty()) else {
            continue;
        };
        match kind {
            "-D" => {
                let name = value.split('=').next().unwrap_or(value);
                flags.defines.insert(name.to_string());
            }
            _ => {
                let dir = anchor(directory, Path::new(value), repo_root)
                    .unwrap_or_else(|| normalize(&directory.join(value)));
                if !flags.include_dirs.contains(&dir) {
                    flags.include_dirs.push(dir);
                }
            }
        }
    }
    flags
}

/// Lexically resolve `.` and `..` without touching the filesystem.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Macro names of `#ifndef X` / `#define X` include guards in `content`.
pub fn include_guards(content: &str) -> BTreeSet<String> {
    INCLUDE_GUARD
        .captures_iter(content)
        .filter_map(|caps| {
            let tested = caps.get(1)?.as_str();
            (caps.get(2)?.as_str() == tested).then(|| tested.to_string())
        })
        .collect()
}

/// Macro names tested by preprocessor conditionals in `content`, include
/// guards excepted.
pub fn conditional_macros(content: &str) -> BTreeSet<String> {
    let guards = include_guards(content);
    let mut macros = BTreeSet::new();
    for directive in CONDITIONAL_DIRECTIVE.captures_iter(content) {
        let expr = directive.get(1).map_or("", |m| m.as_str());
        for caps in CONDITIONAL_NAME.captures_iter(expr) {
            if let Some(name) = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3)) {
                if guards.contains(name.as_str()) {
                    continue;
                }
                macros.insert(name.as_str().to_string());
            }
        }
    }
    macros
}

/// Macro names a header `#define`s.
pub fn defined_macros(content: &str) -> BTreeSet<String> {
    DEFINE_DIRECTIVE
        .captures_iter(content)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Everything the semantic resolver needs to know about how files are built.
#[derive(Debug, Default)]
pub struct BuildFlags {
    repo_root: PathBuf,
    commands: Option<CompileCommands>,
    forced_include: Option<PathBuf>,
    forced_defines: BTreeSet<String>,
}

impl BuildFlags {
    pub fn new(
        repo_root: &Path,
        compile_commands: Option<&Path>,
        forced_include: Option<&Path>,
    ) -> anyhow::Result<Self> {
        let commands = compile_commands
            .map(|path| CompileCommands::load(path, repo_root))
            .transpose()?;
        let forced_defines = match forced_include {
            Some(path) => defined_macros(
                &fs::read_to_string(path)
                    .with_context(|| format!("Failed to read forced include {}", path.display()))?,
            ),
            None => BTreeSet::new(),
        };
        Ok(Self {
            repo_root: repo_root.to_path_buf(),
            commands,
            forced_include: forced_include.map(Path::to_path_buf),
            forced_defines,
        })
    }

    pub fn forced_include(&self) -> Option<&Path> {
        self.forced_include.as_deref()
    }

    /// Flags for the translation unit rooted at `file`: the compile command
    /// when present, otherwise the forced include's defines, otherwise the
    /// conditional-directive heuristic over `file`. Headers pulled into the
    /// unit are preprocessed with these same flags.
    pub fn for_file(&self, file: &Path, content: &str) -> CompileFlags {
        let mut flags = match self.commands.as_ref().and_then(|c| c.get(file)) {
            Some(exact) => exact.clone(),
            None if self.forced_include.is_some() => CompileFlags::default(),
            None => CompileFlags {
                include_dirs: Vec::new(),
                defines: conditional_macros(content),
            },
        };
        flags.defines.extend(self.forced_defines.iter().cloned());
        if !flags.include_dirs.contains(&self.repo_root) {
            flags.include_dirs.push(self.repo_root.clone());
        }
        flags
    }
}
