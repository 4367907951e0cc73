/// Backend lookup by file extension, falling back to content sniffing
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::{BraceBackend, Language, LanguageBackend};

pub struct LanguageRegistry {
    backends: HashMap<Language, Arc<dyn LanguageBackend>>,
}

impl LanguageRegistry {
    /// Registry with no backends
    pub fn empty() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    /// Registry with every built-in backend
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        for language in Language::all() {
            registry.register(Arc::new(BraceBackend::new(language)));
        }
        registry
    }

    /// Add or replace the backend for its language
    pub fn register(&mut self, backend: Arc<dyn LanguageBackend>) {
        self.backends.insert(backend.language(), backend);
    }

    pub fn backend(&self, language: Language) -> Option<Arc<dyn LanguageBackend>> {
        self.backends.get(&language).cloned()
    }

    pub fn languages(&self) -> Vec<Language> {
        let mut languages: Vec<Language> = self.backends.keys().copied().collect();
        languages.sort();
        languages
    }

    /// Determine a file's language from its extension, then its content
    pub fn detect(&self, path: &str, content: &str) -> Option<Language> {
        let by_extension = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .and_then(Language::from_extension);

        by_extension.or_else(|| sniff(content))
    }

    /// Backend for a file, or `None` when it should not be analysed
    pub fn for_file(&self, path: &str, content: &str) -> Option<Arc<dyn LanguageBackend>> {
        let language = self.detect(path, content)?;
        let backend = self.backend(language);
        if backend.is_none() {
            debug!(path, language = %language, "no backend registered");
        }
        backend
    }
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

/// Guess a language from a shebang or the first significant line
fn sniff(content: &str) -> Option<Language> {
    let mut lines = content.lines().map(str::trim).filter(|l| !l.is_empty());
    let first = lines.next()?;

    if let Some(interpreter) = first.strip_prefix("#!") {
        if interpreter.contains("deno") || interpreter.contains("ts-node") {
            return Some(Language::TypeScript);
        }
        if interpreter.contains("node") {
            return Some(Language::JavaScript);
        }
        return None;
    }

    std::iter::once(first)
        .chain(lines)
        .filter(|l| !l.starts_with("//"))
        .take(20)
        .find_map(sniff_line)
}

fn sniff_line(line: &str) -> Option<Language> {
    if line.starts_with("#include") {
        return Some(if line.contains("<iostream>") || line.contains("<vector>") {
            Language::Cpp
        } else {
            Language::C
        });
    }
    if line.starts_with("use ")
        || line.starts_with("mod ")
        || line.starts_with("fn ")
        || line.starts_with("pub ")
        || line.starts_with("#![")
    {
        return Some(Language::Rust);
    }
    if line.starts_with("import ") && line.contains(" from ") {
        return Some(Language::JavaScript);
    }
    if line.starts_with("function ") || line.starts_with("const ") || line.contains("require(") {
        return Some(Language::JavaScript);
    }
    None
}
