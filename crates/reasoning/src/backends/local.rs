/// In-process resolver using line-level heuristics
///
/// Needs no network, so a peer always has some reasoning available. It only
/// claims high confidence when one side's edit subsumes the other's.
use super::{BackendType, ReasoningBackend};
use crate::{ConflictContext, ConflictKind, Patch, Resolution, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        Self
    }

    fn propose(&self, context: &ConflictContext) -> Resolution {
        let local = lines(&context.local_version);
        let remote = lines(&context.remote_version);

        if local == remote {
            return patched(context, &context.local_version, "Both sides made the same change", 0.95);
        }

        match context.conflict_type {
            ConflictKind::CompileTime => {
                let candidates: Vec<(&str, &str)> = [
                    ("local", context.local_version.as_str()),
                    ("remote", context.remote_version.as_str()),
                ]
                .into_iter()
                .filter(|(_, text)| balanced(text))
                .collect();

                match candidates.as_slice() {
                    [(side, text)] => patched(
                        context,
                        text,
                        &format!("Only the {} version is syntactically complete", side),
                        0.78,
                    ),
                    _ => unresolved(
                        "Neither side alone restores a well-formed region",
                        vec![
                            "Keep the local version and re-apply the remote edit by hand".into(),
                            "Keep the remote version and re-apply the local edit by hand".into(),
                        ],
                    ),
                }
            }
            ConflictKind::TypeLevel => {
                let mut alternatives = vec![
                    "Update call sites to match the new signature".to_string(),
                    "Restore the previous signature".to_string(),
                ];
                alternatives.extend(context.diagnostics.iter().map(|d| format!("Check: {}", d)));
                unresolved("A signature and its uses changed concurrently", alternatives)
            }
            ConflictKind::Semantic => {
                if is_subsequence(&remote, &local) {
                    return patched(context, &context.local_version, "The local edit already contains the remote edit", 0.88);
                }
                if is_subsequence(&local, &remote) {
                    return patched(context, &context.remote_version, "The remote edit already contains the local edit", 0.88);
                }

                let mut text = merge_lines(&local, &remote).join("\n");
                if context.local_version.ends_with('\n') {
                    text.push('\n');
                }
                patched(context, &text, "Combined the lines added by both sides", 0.72)
            }
        }
    }
}

#[async_trait::async_trait]
impl ReasoningBackend for LocalBackend {
    fn name(&self) -> &str {
        "Local"
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Local
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn resolve(&self, context: &ConflictContext) -> Result<Resolution> {
        let resolution = self.propose(context);
        resolution.validate()?;
        Ok(resolution)
    }
}

fn lines(text: &str) -> Vec<&str> {
    text.lines().collect()
}

fn patched(context: &ConflictContext, replacement: &str, explanation: &str, confidence: f64) -> Resolution {
    Resolution {
        patch: Some(Patch {
            lines: context.region.clone(),
            original: context.merged.clone(),
            replacement: replacement.to_string(),
        }),
        explanation: explanation.to_string(),
        confidence,
        alternatives: Vec::new(),
    }
}

fn unresolved(explanation: &str, alternatives: Vec<String>) -> Resolution {
    Resolution {
        patch: None,
        explanation: explanation.to_string(),
        confidence: 0.4,
        alternatives,
    }
}

/// Delimiter balance, ignoring string contents
fn balanced(text: &str) -> bool {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '(' | '[' | '{' => stack.push(c),
            ')' => {
                if stack.pop() != Some('(') {
                    return false;
                }
            }
            ']' => {
                if stack.pop() != Some('[') {
                    return false;
                }
            }
            '}' => {
                if stack.pop() != Some('{') {
                    return false;
                }
            }
            _ => {}
        }
    }
    stack.is_empty() && !in_string
}

/// Interleave two line sequences around their longest common subsequence,
/// local additions before remote ones at each gap
fn merge_lines<'a>(local: &[&'a str], remote: &[&'a str]) -> Vec<&'a str> {
    let (n, m) = (local.len(), remote.len());
    let mut lcs = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if local[i] == remote[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut merged = Vec::with_capacity(n + m);
    let (mut i, mut j) = (0, 0);
    let mut remote_gap = Vec::new();
    while i < n && j < m {
        if local[i] == remote[j] {
            merged.append(&mut remote_gap);
            merged.push(local[i]);
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            merged.push(local[i]);
            i += 1;
        } else {
            remote_gap.push(remote[j]);
            j += 1;
        }
    }
    merged.extend_from_slice(&local[i..]);
    merged.append(&mut remote_gap);
    merged.extend_from_slice(&remote[j..]);
    merged
}

/// Whether `small` appears in order inside `big`
fn is_subsequence(small: &[&str], big: &[&str]) -> bool {
    let mut it = big.iter();
    small.iter().all(|line| it.any(|candidate| candidate == line))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(kind: ConflictKind, local: &str, remote: &str) -> ConflictContext {
        ConflictContext {
            file_path: "src/lib.rs".into(),
            language: Some("Rust".into()),
            conflict_type: kind,
            region: 10..12,
            merged: "merged\n".into(),
            local_version: local.into(),
            remote_version: remote.into(),
            surrounding_code: String::new(),
            diagnostics: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_superset_edit_is_high_confidence() {
        let ctx = context(
            ConflictKind::Semantic,
            "    let a = 1;\n    let b = 2;\n",
            "    let a = 1;\n",
        );
        let resolution = LocalBackend::new().resolve(&ctx).await.unwrap();

        assert!(resolution.confidence >= 0.85);
        assert_eq!(resolution.patch.unwrap().replacement, ctx.local_version);
    }

    #[tokio::test]
    async fn test_disjoint_semantic_edits_are_combined() {
        let ctx = context(ConflictKind::Semantic, "    one();\n", "    two();\n");
        let resolution = LocalBackend::new().resolve(&ctx).await.unwrap();

        assert!((0.70..0.85).contains(&resolution.confidence));
        assert_eq!(resolution.patch.unwrap().replacement, "    one();\n    two();\n");
    }

    #[tokio::test]
    async fn test_compile_time_prefers_balanced_side() {
        let ctx = context(ConflictKind::CompileTime, "f(a, {\n", "f(a, b)\n");
        let resolution = LocalBackend::new().resolve(&ctx).await.unwrap();

        assert_eq!(resolution.patch.unwrap().replacement, "f(a, b)\n");
        assert!(resolution.explanation.contains("remote"));
    }

    #[tokio::test]
    async fn test_type_level_has_no_patch() {
        let mut ctx = context(ConflictKind::TypeLevel, "add(1, 2)\n", "add(1)\n");
        ctx.diagnostics.push("add takes 1 argument".into());
        let resolution = LocalBackend::new().resolve(&ctx).await.unwrap();

        assert!(resolution.patch.is_none());
        assert!(resolution.confidence < 0.70);
        assert_eq!(resolution.alternatives.len(), 3);
    }

    #[test]
    fn test_merge_lines_keeps_common_structure() {
        let local = ["fn main() {", "    a();", "    b();", "}"];
        let remote = ["fn main() {", "    a();", "    c();", "}"];
        assert_eq!(
            merge_lines(&local, &remote),
            vec!["fn main() {", "    a();", "    b();", "    c();", "}"]
        );
    }

    #[test]
    fn test_balanced_ignores_strings() {
        assert!(balanced("let s = \"(\";"));
        assert!(!balanced("foo(]"));
    }
}
