/// Conflict detection over merged document content
///
/// Runs after every merge, off the merge's critical path. The document is
/// captured into a [`MergeView`] under its lock and analysed without it.
/// Checks are scoped to the lines the triggering operations touched, and a
/// failure only becomes a conflict when an operation concurrent with the
/// trigger takes part in it; a single author's half-typed code is not a
/// conflict. Content produced by an applied resolution is always checked.
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Range;
use tracing::{debug, trace};

use reasoning::ConflictKind;
use replica::{OpId, ReplicatedDocument};
use syntax::{EditSpan, FunctionSymbol, LanguageBackend, LanguageRegistry, SymbolTable, SyntaxTree};

/// How far back in a document's history concurrency is searched
pub const CONCURRENCY_WINDOW: usize = 128;

/// Concurrent edits this close to a parse failure take part in it
const NEARBY_LINES: usize = 3;

/// Where merged operations came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MergeOrigin {
    Local,
    Remote,
    /// A patch applied to resolve a conflict
    Resolution,
}

/// Operations that just merged into one document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeEvent {
    pub path: String,
    pub ops: Vec<OpId>,
    pub origin: MergeOrigin,
}

impl MergeEvent {
    pub fn new(path: impl Into<String>, ops: Vec<OpId>, origin: MergeOrigin) -> Self {
        Self {
            path: path.into(),
            ops,
            origin,
        }
    }

    /// Fold a later event for the same document into this one
    pub fn absorb(&mut self, other: MergeEvent) {
        for op in other.ops {
            if !self.ops.contains(&op) {
                self.ops.push(op);
            }
        }
        self.origin = self.origin.max(other.origin);
    }
}

/// An applied operation and the lines it affects in the current text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TouchedOp {
    pub id: OpId,
    pub lines: Range<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub op: TouchedOp,
    /// Recent operations neither before nor after it
    pub concurrent: Vec<TouchedOp>,
}

/// Document state captured for analysis
#[derive(Debug, Clone)]
pub struct MergeView {
    pub path: String,
    pub text: String,
    pub operation_count: usize,
    pub new_operations: usize,
    pub triggers: Vec<Trigger>,
}

impl MergeView {
    pub fn capture(doc: &ReplicatedDocument, ops: &[OpId], window: usize) -> Self {
        let mut lines: HashMap<OpId, Option<Range<usize>>> = HashMap::new();
        let mut touched = |id: &OpId| -> Option<TouchedOp> {
            let span = lines.entry(*id).or_insert_with(|| doc.touched_lines(id)).clone()?;
            Some(TouchedOp { id: *id, lines: span })
        };

        let mut triggers = Vec::new();
        for id in ops.iter().filter(|id| doc.contains(id)) {
            let Some(op) = touched(id) else { continue };
            let concurrent = doc
                .concurrent_with(id, window)
                .iter()
                .filter_map(|other| touched(other))
                .collect();
            triggers.push(Trigger { op, concurrent });
        }

        Self {
            path: doc.path().to_string(),
            text: doc.text(),
            operation_count: doc.operation_count(),
            new_operations: ops.iter().filter(|id| doc.contains(id)).count(),
            triggers,
        }
    }

    /// Lines touched by the triggering operations
    pub fn touched_hull(&self) -> Option<Range<usize>> {
        self.triggers
            .iter()
            .map(|t| t.op.lines.clone())
            .reduce(|a, b| hull(&a, &b))
    }

    /// Triggering operations touching any of `spans`, and operations
    /// concurrent with the merge touching any of them
    fn involved(&self, spans: &[Range<usize>]) -> (BTreeSet<OpId>, BTreeSet<OpId>) {
        let hits = |lines: &Range<usize>| spans.iter().any(|s| overlaps(lines, s));
        let triggers = self
            .triggers
            .iter()
            .filter(|t| hits(&t.op.lines))
            .map(|t| t.op.id)
            .collect();
        let concurrent = self
            .triggers
            .iter()
            .flat_map(|t| t.concurrent.iter())
            .filter(|c| hits(&c.lines))
            .map(|c| c.id)
            .collect();
        (triggers, concurrent)
    }

    fn lines_of(&self, id: &OpId) -> Option<Range<usize>> {
        self.triggers
            .iter()
            .flat_map(|t| std::iter::once(&t.op).chain(t.concurrent.iter()))
            .find(|o| o.id == *id)
            .map(|o| o.lines.clone())
    }
}

/// A conflict found by analysis, before it is recorded
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedConflict {
    pub path: String,
    pub region: Range<usize>,
    pub kind: ConflictKind,
    pub contributing: Vec<OpId>,
    pub diagnostics: Vec<String>,
}

/// What is remembered about a file between analyses
#[derive(Debug, Clone, Default)]
struct FileAnalysis {
    tree: Option<SyntaxTree>,
    /// Operations covered by `tree`
    analyzed_ops: usize,
    /// Every function ever declared, with its last known lines
    known_functions: BTreeMap<String, Range<usize>>,
}

pub struct ConflictDetector {
    registry: LanguageRegistry,
    files: HashMap<String, FileAnalysis>,
}

impl ConflictDetector {
    pub fn new(registry: LanguageRegistry) -> Self {
        Self {
            registry,
            files: HashMap::new(),
        }
    }

    /// Display name of the language the view's file is parsed as
    pub fn language_for(&self, view: &MergeView) -> Option<String> {
        self.registry
            .for_file(&view.path, &view.text)
            .map(|backend| backend.language().name().to_string())
    }

    pub fn analyze(&mut self, view: &MergeView, origin: MergeOrigin) -> Vec<DetectedConflict> {
        let Some(backend) = self.registry.for_file(&view.path, &view.text) else {
            self.files.remove(&view.path);
            return Vec::new();
        };
        let Some(touched) = view.touched_hull() else {
            return Vec::new();
        };
        let forced = origin == MergeOrigin::Resolution;
        let state = self.files.entry(view.path.clone()).or_default();

        let parsed = parse(backend.as_ref(), state, view, &touched);
        state.analyzed_ops = view.operation_count;

        let tree = match parsed {
            Ok(tree) => tree,
            Err(errors) => {
                state.tree = None;
                return compile_time(view, &touched, &errors, forced).into_iter().collect();
            }
        };

        let symbols = backend.extract_symbols(&tree);
        let mut conflicts = type_level(view, &symbols, backend.language(), forced);
        if conflicts.is_empty() {
            conflicts.extend(vanished_names(view, &symbols, &state.known_functions, forced));
            conflicts.extend(same_function(view, &symbols));
        }

        for f in &symbols.functions {
            state.known_functions.insert(f.name.clone(), f.lines.clone());
        }
        state.tree = Some(tree);

        if !conflicts.is_empty() {
            debug!(path = %view.path, found = conflicts.len(), "merge produced conflicts");
        }
        conflicts
    }
}

impl Default for ConflictDetector {
    fn default() -> Self {
        Self::new(LanguageRegistry::with_builtin())
    }
}

/// Re-parse only what changed when the prior tree covers every operation
/// before this merge, otherwise parse the whole file
fn parse(
    backend: &dyn LanguageBackend,
    state: &FileAnalysis,
    view: &MergeView,
    touched: &Range<usize>,
) -> syntax::ParseResult {
    match &state.tree {
        Some(prior) if state.analyzed_ops + view.new_operations == view.operation_count => {
            let edit = EditSpan::from_new_lines(
                touched.clone(),
                prior.line_count,
                syntax::line_count(&view.text),
            );
            trace!(path = %view.path, ?edit, "incremental parse");
            backend.incremental_parse(prior, &view.text, &edit)
        }
        _ => backend.parse(&view.text),
    }
}

fn compile_time(
    view: &MergeView,
    touched: &Range<usize>,
    errors: &[syntax::SyntaxError],
    forced: bool,
) -> Option<DetectedConflict> {
    let first = errors.first()?;
    let base = hull(touched, &(first.line..first.line + 1));
    let near = base.start.saturating_sub(NEARBY_LINES)..base.end + NEARBY_LINES;
    let (triggers, concurrent) = view.involved(&[near]);
    if concurrent.is_empty() && !forced {
        return None;
    }

    let region = concurrent
        .iter()
        .filter_map(|id| view.lines_of(id))
        .fold(base, |region, lines| hull(&region, &lines));
    Some(DetectedConflict {
        path: view.path.clone(),
        region,
        kind: ConflictKind::CompileTime,
        contributing: triggers.union(&concurrent).copied().collect(),
        diagnostics: errors.iter().map(|e| e.to_string()).collect(),
    })
}

fn type_level(
    view: &MergeView,
    symbols: &SymbolTable,
    language: syntax::Language,
    forced: bool,
) -> Vec<DetectedConflict> {
    symbols
        .arity_mismatches(language)
        .into_iter()
        .filter_map(|mismatch| {
            let call_line = mismatch.call.line..mismatch.call.line + 1;
            let mut spans = vec![call_line.clone()];
            spans.extend(
                mismatch
                    .expected
                    .iter()
                    .map(|decl| decl.lines.start..decl.lines.start + 1),
            );
            let (triggers, concurrent) = view.involved(&spans);
            if triggers.is_empty() || (concurrent.is_empty() && !forced) {
                return None;
            }

            let expected = mismatch
                .expected
                .iter()
                .map(describe_arity)
                .collect::<Vec<_>>()
                .join(" or ");
            Some(DetectedConflict {
                path: view.path.clone(),
                region: call_line,
                kind: ConflictKind::TypeLevel,
                contributing: triggers.union(&concurrent).copied().collect(),
                diagnostics: vec![format!(
                    "{}:{}: `{}` called with {} argument(s), declared with {}",
                    mismatch.call.line + 1,
                    mismatch.call.col + 1,
                    mismatch.call.name,
                    mismatch.call.args,
                    expected
                )],
            })
        })
        .collect()
}

fn describe_arity(f: &FunctionSymbol) -> String {
    match f.max_arity {
        Some(max) if max == f.min_arity => max.to_string(),
        Some(max) => format!("{}..={}", f.min_arity, max),
        None => format!("at least {}", f.min_arity),
    }
}

/// Calls to a function that was declared before but no longer is
fn vanished_names(
    view: &MergeView,
    symbols: &SymbolTable,
    known: &BTreeMap<String, Range<usize>>,
    forced: bool,
) -> Vec<DetectedConflict> {
    let declared = symbols.declared_names();
    symbols
        .calls
        .iter()
        .filter(|call| !declared.contains(&call.name))
        .filter_map(|call| {
            let old_decl = known.get(&call.name)?;
            let call_line = call.line..call.line + 1;

            let (triggers, concurrent) = view.involved(&[call_line.clone(), old_decl.clone()]);
            if triggers.is_empty() || (concurrent.is_empty() && !forced) {
                return None;
            }

            Some(DetectedConflict {
                path: view.path.clone(),
                region: call_line,
                kind: ConflictKind::Semantic,
                contributing: triggers.union(&concurrent).copied().collect(),
                diagnostics: vec![format!(
                    "{}:{}: `{}` is still called but no longer declared",
                    call.line + 1,
                    call.col + 1,
                    call.name
                )],
            })
        })
        .collect()
}

/// Concurrent operations inside the body of the same function
fn same_function(view: &MergeView, symbols: &SymbolTable) -> Vec<DetectedConflict> {
    let mut by_function: BTreeMap<(usize, usize), (FunctionSymbol, BTreeSet<OpId>)> = BTreeMap::new();

    for trigger in &view.triggers {
        let Some(f) = innermost(symbols, &trigger.op.lines) else {
            continue;
        };
        let rivals: Vec<OpId> = trigger
            .concurrent
            .iter()
            .filter(|c| innermost(symbols, &c.lines) == Some(f))
            .map(|c| c.id)
            .collect();
        if rivals.is_empty() {
            continue;
        }
        let entry = by_function
            .entry((f.lines.start, f.lines.end))
            .or_insert_with(|| (f.clone(), BTreeSet::new()));
        entry.1.insert(trigger.op.id);
        entry.1.extend(rivals);
    }

    by_function
        .into_values()
        .map(|(f, ops)| DetectedConflict {
            path: view.path.clone(),
            region: f.lines.clone(),
            kind: ConflictKind::Semantic,
            contributing: ops.into_iter().collect(),
            diagnostics: vec![format!(
                "{}: concurrent edits inside `{}`",
                f.lines.start + 1,
                f.name
            )],
        })
        .collect()
}

/// Innermost function enclosing every line of the span
fn innermost<'a>(symbols: &'a SymbolTable, lines: &Range<usize>) -> Option<&'a FunctionSymbol> {
    let last = lines.end.max(lines.start + 1) - 1;
    symbols
        .function_at_line(lines.start)
        .filter(|f| f.contains_line(last))
}

pub(crate) fn hull(a: &Range<usize>, b: &Range<usize>) -> Range<usize> {
    a.start.min(b.start)..a.end.max(b.end)
}

/// Line spans share a line; empty spans count as their start line
pub(crate) fn overlaps(a: &Range<usize>, b: &Range<usize>) -> bool {
    let end = |r: &Range<usize>| r.end.max(r.start + 1);
    a.start < end(b) && b.start < end(a)
}
