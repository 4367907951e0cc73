/// Source analysis for merged documents
/// Parses rendered file content and extracts the symbols conflict checks need
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::ops::Range;

pub mod brace;
pub mod registry;

pub use brace::BraceBackend;
pub use registry::LanguageRegistry;

/// Languages with a built-in backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Rust,
    JavaScript,
    TypeScript,
    C,
    Cpp,
}

impl Language {
    pub fn name(&self) -> &str {
        match self {
            Self::Rust => "Rust",
            Self::JavaScript => "JavaScript",
            Self::TypeScript => "TypeScript",
            Self::C => "C",
            Self::Cpp => "C++",
        }
    }

    pub fn all() -> [Self; 5] {
        [
            Self::Rust,
            Self::JavaScript,
            Self::TypeScript,
            Self::C,
            Self::Cpp,
        ]
    }

    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            Self::Rust => &["rs"],
            Self::JavaScript => &["js", "mjs", "cjs", "jsx"],
            Self::TypeScript => &["ts", "mts", "tsx"],
            Self::C => &["c", "h"],
            Self::Cpp => &["cc", "cpp", "cxx", "hpp", "hh", "hxx"],
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.to_lowercase();
        Self::all()
            .into_iter()
            .find(|lang| lang.extensions().contains(&ext.as_str()))
    }

    /// Whether a call with the wrong number of arguments is an error.
    /// JavaScript silently pads or drops arguments.
    pub fn checks_arity(&self) -> bool {
        !matches!(self, Self::JavaScript)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Parse failure location (0-based line and column)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntaxError {
    pub line: usize,
    pub col: usize,
    pub message: String,
}

impl SyntaxError {
    pub fn new(line: usize, col: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            col,
            message: message.into(),
        }
    }
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.line + 1, self.col + 1, self.message)
    }
}

/// A declared function or method
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSymbol {
    pub name: String,
    /// Parameters without a default value
    pub min_arity: usize,
    /// `None` for variadic functions
    pub max_arity: Option<usize>,
    /// Declaration line through closing line (end exclusive)
    pub lines: Range<usize>,
    /// Brace nesting depth of the declaration
    pub depth: usize,
    /// Takes a receiver (`self`), so it is never called bare
    pub is_method: bool,
}

impl FunctionSymbol {
    pub fn accepts(&self, args: usize) -> bool {
        args >= self.min_arity && self.max_arity.map_or(true, |max| args <= max)
    }

    pub fn contains_line(&self, line: usize) -> bool {
        self.lines.contains(&line)
    }
}

/// A bare call `name(args)` (not a method or path call)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    pub name: String,
    pub args: usize,
    pub line: usize,
    pub col: usize,
}

/// A call whose argument count no declaration accepts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArityMismatch {
    pub call: CallSite,
    pub expected: Vec<FunctionSymbol>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolTable {
    pub functions: Vec<FunctionSymbol>,
    pub calls: Vec<CallSite>,
}

impl SymbolTable {
    /// All declarations of `name` (several when overloaded)
    pub fn functions_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a FunctionSymbol> + 'a {
        self.functions.iter().filter(move |f| f.name == name)
    }

    pub fn declared_names(&self) -> BTreeSet<String> {
        self.functions.iter().map(|f| f.name.clone()).collect()
    }

    /// Innermost function whose body contains `line`
    pub fn function_at_line(&self, line: usize) -> Option<&FunctionSymbol> {
        self.functions
            .iter()
            .filter(|f| f.contains_line(line))
            .max_by_key(|f| f.depth)
    }

    /// Functions overlapping the given line span
    pub fn functions_in<'a>(&'a self, lines: &'a Range<usize>) -> impl Iterator<Item = &'a FunctionSymbol> + 'a {
        self.functions
            .iter()
            .filter(move |f| f.lines.start < lines.end && lines.start < f.lines.end)
    }

    /// Bare calls that match a callable declaration by name but not by arity
    pub fn arity_mismatches(&self, language: Language) -> Vec<ArityMismatch> {
        if !language.checks_arity() {
            return Vec::new();
        }

        self.calls
            .iter()
            .filter_map(|call| {
                let candidates: Vec<FunctionSymbol> = self
                    .functions_named(&call.name)
                    .filter(|f| is_bare_callable(language, f))
                    .cloned()
                    .collect();
                if candidates.is_empty() || candidates.iter().any(|f| f.accepts(call.args)) {
                    return None;
                }
                Some(ArityMismatch {
                    call: call.clone(),
                    expected: candidates,
                })
            })
            .collect()
    }

    pub(crate) fn shift_lines(&mut self, delta: isize) {
        for f in &mut self.functions {
            f.lines = shift_range(&f.lines, delta);
        }
        for c in &mut self.calls {
            c.line = shift(c.line, delta);
        }
    }
}

fn is_bare_callable(language: Language, f: &FunctionSymbol) -> bool {
    if f.is_method {
        return false;
    }
    // Rust associated functions need a path to be called
    language != Language::Rust || f.depth == 0
}

/// A top-level item: everything up to a depth-0 `;` or closing `}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSpan {
    pub lines: Range<usize>,
    pub is_block: bool,
}

/// Successful parse result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntaxTree {
    pub language: Language,
    pub line_count: usize,
    pub items: Vec<ItemSpan>,
    pub symbols: SymbolTable,
}

pub type ParseResult = Result<SyntaxTree, Vec<SyntaxError>>;

/// A change between two versions of a file, in lines (end exclusive).
/// Lines `start..old_end` of the old text became `start..new_end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditSpan {
    pub start: usize,
    pub old_end: usize,
    pub new_end: usize,
}

impl EditSpan {
    pub fn delta(&self) -> isize {
        self.new_end as isize - self.old_end as isize
    }

    /// Derive the old-text span from the changed lines in the new text
    /// and the line counts before and after
    pub fn from_new_lines(new_lines: Range<usize>, old_count: usize, new_count: usize) -> Self {
        let delta = new_count as isize - old_count as isize;
        let old_end = (new_lines.end as isize - delta).max(new_lines.start as isize) as usize;
        Self {
            start: new_lines.start,
            old_end,
            new_end: new_lines.end,
        }
    }
}

/// Parser capability, one implementation per language family
pub trait LanguageBackend: Send + Sync {
    fn language(&self) -> Language;

    fn parse(&self, text: &str) -> ParseResult;

    /// Re-parse after an edit, reusing `prior` where the edit allows
    fn incremental_parse(&self, prior: &SyntaxTree, text: &str, edit: &EditSpan) -> ParseResult {
        let _ = (prior, edit);
        self.parse(text)
    }

    fn extract_symbols(&self, tree: &SyntaxTree) -> SymbolTable {
        tree.symbols.clone()
    }
}

pub(crate) fn shift(line: usize, delta: isize) -> usize {
    (line as isize + delta).max(0) as usize
}

pub(crate) fn shift_range(range: &Range<usize>, delta: isize) -> Range<usize> {
    shift(range.start, delta)..shift(range.end, delta)
}

/// Number of lines as the document store counts them
pub fn line_count(text: &str) -> usize {
    text.split('\n').count()
}
