/// Backend for the curly-brace language family (Rust, JS/TS, C/C++)
///
/// Lexes literals and comments precisely enough that delimiters inside them
/// never count, checks delimiter balance, then scans the token stream for
/// function declarations and bare call sites. No expression grammar is built.
use std::collections::HashSet;
use std::ops::Range;
use tracing::debug;

use crate::{
    line_count, shift, shift_range, CallSite, EditSpan, FunctionSymbol, ItemSpan, Language,
    LanguageBackend, ParseResult, SymbolTable, SyntaxError, SyntaxTree,
};

/// Identifiers that are never function names and never precede a declaration
const KEYWORDS: &[&str] = &[
    "if", "else", "while", "for", "loop", "match", "switch", "case", "catch", "return", "sizeof",
    "typeof", "alignof", "fn", "function", "new", "delete", "throw", "await", "async", "yield",
    "do", "try", "with", "in", "as", "super", "this", "where", "impl", "move", "instanceof",
    "goto", "let", "const", "var", "static", "struct", "enum", "union", "class", "interface",
    "type", "use", "mod", "pub", "import", "export",
];

fn is_keyword(word: &str) -> bool {
    KEYWORDS.contains(&word)
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_continue(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Ident(String),
    Punct(String),
    Open(char),
    Close(char),
    Literal,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    line: usize,
    col: usize,
}

impl Token {
    fn ident(&self) -> Option<&str> {
        match &self.tok {
            Tok::Ident(word) => Some(word),
            _ => None,
        }
    }

    fn is_ident(&self, word: &str) -> bool {
        self.ident() == Some(word)
    }

    fn is_punct(&self, p: &str) -> bool {
        matches!(&self.tok, Tok::Punct(s) if s == p)
    }
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
    language: Language,
    tokens: Vec<Token>,
    errors: Vec<SyntaxError>,
}

impl Lexer {
    fn new(text: &str, language: Language) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
            line: 0,
            col: 0,
            language,
            tokens: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn peek(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.pos + ahead).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.col = 0;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn push(&mut self, tok: Tok, line: usize, col: usize) {
        self.tokens.push(Token { tok, line, col });
    }

    fn error(&mut self, line: usize, col: usize, message: impl Into<String>) {
        self.errors.push(SyntaxError::new(line, col, message));
    }

    fn run(mut self) -> Result<Vec<Token>, Vec<SyntaxError>> {
        while let Some(c) = self.peek(0) {
            let (line, col) = (self.line, self.col);
            match c {
                c if c.is_whitespace() => {
                    self.bump();
                }
                '/' if self.peek(1) == Some('/') => self.skip_line(),
                '/' if self.peek(1) == Some('*') => self.block_comment(line, col),
                '#' if self.at_preprocessor_line() => self.skip_line(),
                '"' => {
                    self.bump();
                    let multiline = self.language == Language::Rust;
                    self.quoted('"', line, col, multiline, true, "string literal");
                }
                '`' if matches!(self.language, Language::JavaScript | Language::TypeScript) => {
                    self.bump();
                    self.quoted('`', line, col, true, true, "template literal");
                }
                '\'' => self.single_quote(line, col),
                c if c.is_ascii_digit() => self.number(line, col),
                c if is_ident_start(c) => self.ident(line, col),
                '(' | '[' | '{' => {
                    self.bump();
                    self.push(Tok::Open(c), line, col);
                }
                ')' | ']' | '}' => {
                    self.bump();
                    self.push(Tok::Close(c), line, col);
                }
                _ => self.punct(line, col),
            }
        }

        if self.errors.is_empty() {
            Ok(self.tokens)
        } else {
            Err(self.errors)
        }
    }

    fn skip_line(&mut self) {
        while self.peek(0).is_some_and(|c| c != '\n') {
            self.bump();
        }
    }

    fn at_preprocessor_line(&self) -> bool {
        matches!(self.language, Language::C | Language::Cpp)
            && self.tokens.last().map_or(true, |t| t.line < self.line)
    }

    fn block_comment(&mut self, line: usize, col: usize) {
        self.bump();
        self.bump();
        let nests = self.language == Language::Rust;
        let mut depth = 1;

        while depth > 0 {
            match (self.peek(0), self.peek(1)) {
                (None, _) => {
                    self.error(line, col, "unterminated block comment");
                    return;
                }
                (Some('*'), Some('/')) => {
                    self.bump();
                    self.bump();
                    depth -= 1;
                }
                (Some('/'), Some('*')) if nests => {
                    self.bump();
                    self.bump();
                    depth += 1;
                }
                _ => {
                    self.bump();
                }
            }
        }
    }

    /// Consume a literal after its opening delimiter
    fn quoted(
        &mut self,
        delim: char,
        line: usize,
        col: usize,
        multiline: bool,
        escapes: bool,
        what: &str,
    ) {
        loop {
            match self.peek(0) {
                None => {
                    self.error(line, col, format!("unterminated {}", what));
                    return;
                }
                Some('\n') if !multiline => {
                    self.error(line, col, format!("unterminated {}", what));
                    return;
                }
                Some('\\') if escapes => {
                    self.bump();
                    self.bump();
                }
                Some(c) if c == delim => {
                    self.bump();
                    self.push(Tok::Literal, line, col);
                    return;
                }
                Some(_) => {
                    self.bump();
                }
            }
        }
    }

    fn single_quote(&mut self, line: usize, col: usize) {
        self.bump();
        match self.language {
            Language::JavaScript | Language::TypeScript => {
                self.quoted('\'', line, col, false, true, "string literal")
            }
            Language::Rust => {
                // 'x' and '\n' are characters; 'a with no closing quote is a lifetime or label
                let is_char = self.peek(0) == Some('\\')
                    || (self.peek(0).is_some() && self.peek(1) == Some('\''));
                if is_char {
                    self.quoted('\'', line, col, false, true, "character literal");
                } else {
                    while self.peek(0).is_some_and(is_ident_continue) {
                        self.bump();
                    }
                    self.push(Tok::Literal, line, col);
                }
            }
            _ => self.quoted('\'', line, col, false, true, "character literal"),
        }
    }

    fn number(&mut self, line: usize, col: usize) {
        while let Some(c) = self.peek(0) {
            let fraction = c == '.' && self.peek(1).is_some_and(|n| n.is_ascii_digit());
            if !(c.is_alphanumeric() || c == '_' || fraction) {
                break;
            }
            self.bump();
        }
        self.push(Tok::Literal, line, col);
    }

    fn ident(&mut self, line: usize, col: usize) {
        let word = self.take_word();
        if self.language == Language::Rust
            && matches!(word.as_str(), "r" | "b" | "br" | "c" | "cr")
            && self.rust_prefixed_literal(&word, line, col)
        {
            return;
        }
        self.push(Tok::Ident(word), line, col);
    }

    fn take_word(&mut self) -> String {
        let start = self.pos;
        while self.peek(0).is_some_and(is_ident_continue) {
            self.bump();
        }
        self.chars[start..self.pos].iter().collect()
    }

    /// `b"..."`, `r"..."`, `r#"..."#` and raw identifiers such as `r#type`
    fn rust_prefixed_literal(&mut self, prefix: &str, line: usize, col: usize) -> bool {
        if !prefix.ends_with('r') {
            if self.peek(0) == Some('"') {
                self.bump();
                self.quoted('"', line, col, true, true, "string literal");
                return true;
            }
            return false;
        }

        let mut hashes = 0;
        while self.peek(hashes) == Some('#') {
            hashes += 1;
        }
        match self.peek(hashes) {
            Some('"') => {
                for _ in 0..=hashes {
                    self.bump();
                }
                self.raw_string(hashes, line, col);
                true
            }
            Some(c) if prefix == "r" && hashes == 1 && is_ident_start(c) => {
                self.bump();
                let word = self.take_word();
                self.push(Tok::Ident(word), line, col);
                true
            }
            _ => false,
        }
    }

    fn raw_string(&mut self, hashes: usize, line: usize, col: usize) {
        loop {
            match self.bump() {
                None => {
                    self.error(line, col, "unterminated raw string literal");
                    return;
                }
                Some('"') if (0..hashes).all(|i| self.peek(i) == Some('#')) => {
                    for _ in 0..hashes {
                        self.bump();
                    }
                    self.push(Tok::Literal, line, col);
                    return;
                }
                Some(_) => {}
            }
        }
    }

    fn punct(&mut self, line: usize, col: usize) {
        for op in ["...", "::", "->", "=>"] {
            if op.chars().enumerate().all(|(i, c)| self.peek(i) == Some(c)) {
                for _ in 0..op.len() {
                    self.bump();
                }
                self.push(Tok::Punct(op.to_string()), line, col);
                return;
            }
        }
        if let Some(c) = self.bump() {
            self.push(Tok::Punct(c.to_string()), line, col);
        }
    }
}

fn closing(open: char) -> char {
    match open {
        '(' => ')',
        '[' => ']',
        _ => '}',
    }
}

/// Index of each delimiter's partner (non-delimiters map to themselves)
fn match_delimiters(tokens: &[Token]) -> Result<Vec<usize>, Vec<SyntaxError>> {
    let mut partner: Vec<usize> = (0..tokens.len()).collect();
    let mut stack: Vec<(usize, char)> = Vec::new();

    for (i, token) in tokens.iter().enumerate() {
        match &token.tok {
            Tok::Open(open) => stack.push((i, *open)),
            Tok::Close(close) => match stack.pop() {
                Some((j, open)) if closing(open) == *close => {
                    partner[i] = j;
                    partner[j] = i;
                }
                Some((j, open)) => {
                    return Err(vec![
                        SyntaxError::new(
                            token.line,
                            token.col,
                            format!(
                                "mismatched closing delimiter `{}`, expected `{}`",
                                close,
                                closing(open)
                            ),
                        ),
                        SyntaxError::new(
                            tokens[j].line,
                            tokens[j].col,
                            format!("unclosed delimiter `{}`", open),
                        ),
                    ]);
                }
                None => {
                    return Err(vec![SyntaxError::new(
                        token.line,
                        token.col,
                        format!("unexpected closing delimiter `{}`", close),
                    )]);
                }
            },
            _ => {}
        }
    }

    if stack.is_empty() {
        return Ok(partner);
    }
    Err(stack
        .into_iter()
        .map(|(j, open)| {
            SyntaxError::new(
                tokens[j].line,
                tokens[j].col,
                format!("unclosed delimiter `{}`", open),
            )
        })
        .collect())
}

#[derive(Debug, Default)]
struct Signature {
    required: usize,
    optional: usize,
    variadic: bool,
    receiver: bool,
}

struct Analyzer<'a> {
    tokens: &'a [Token],
    partner: &'a [usize],
    depth: Vec<usize>,
    language: Language,
}

impl<'a> Analyzer<'a> {
    fn new(tokens: &'a [Token], partner: &'a [usize], language: Language) -> Self {
        let mut depth = Vec::with_capacity(tokens.len());
        let mut d = 0usize;
        for token in tokens {
            if token.tok == Tok::Close('}') {
                d = d.saturating_sub(1);
            }
            depth.push(d);
            if token.tok == Tok::Open('{') {
                d += 1;
            }
        }

        Self {
            tokens,
            partner,
            depth,
            language,
        }
    }

    fn is_open_at(&self, i: usize, c: char) -> bool {
        self.tokens.get(i).is_some_and(|t| t.tok == Tok::Open(c))
    }

    fn item_span(&self, from: usize, to: usize, is_block: bool) -> ItemSpan {
        ItemSpan {
            lines: self.tokens[from].line..self.tokens[to].line + 1,
            is_block,
        }
    }

    fn items(&self) -> Vec<ItemSpan> {
        let mut items = Vec::new();
        let mut start: Option<usize> = None;
        let mut is_block = false;
        let mut nesting = 0usize;

        for (i, token) in self.tokens.iter().enumerate() {
            if start.is_none() {
                start = Some(i);
                is_block = false;
            }

            let ends_item = match &token.tok {
                Tok::Open(c) => {
                    if nesting == 0 && *c == '{' {
                        is_block = true;
                    }
                    nesting += 1;
                    false
                }
                Tok::Close(c) => {
                    nesting = nesting.saturating_sub(1);
                    let semicolon_follows = self.tokens.get(i + 1).is_some_and(|n| n.is_punct(";"));
                    nesting == 0 && *c == '}' && !semicolon_follows
                }
                Tok::Punct(p) => nesting == 0 && p == ";",
                _ => false,
            };
            if ends_item {
                if let Some(from) = start.take() {
                    items.push(self.item_span(from, i, is_block));
                }
            }
        }

        if let Some(from) = start {
            items.push(self.item_span(from, self.tokens.len() - 1, is_block));
        }
        items
    }

    /// Declared functions and the token indices of their names
    fn functions(&self) -> (Vec<FunctionSymbol>, HashSet<usize>) {
        let mut functions = Vec::new();
        let mut declared = HashSet::new();

        for (i, token) in self.tokens.iter().enumerate() {
            let found = match (self.language, token.ident()) {
                (Language::Rust, Some("fn")) => self.keyword_function(i),
                (Language::JavaScript | Language::TypeScript, Some("function")) => {
                    self.keyword_function(i)
                }
                (
                    Language::JavaScript | Language::TypeScript,
                    Some("const" | "let" | "var"),
                ) => self.arrow_function(i),
                (Language::C | Language::Cpp, Some(_)) => {
                    self.c_style_function(i)
                }
                _ => None,
            };
            if let Some((name_idx, symbol)) = found {
                declared.insert(name_idx);
                functions.push(symbol);
            }
        }
        (functions, declared)
    }

    /// `fn name` and `function name`
    fn keyword_function(&self, kw: usize) -> Option<(usize, FunctionSymbol)> {
        let mut i = kw + 1;
        if self.tokens.get(i)?.is_punct("*") {
            i += 1;
        }

        let name_idx = i;
        let name = self.tokens.get(name_idx)?.ident()?;
        if is_keyword(name) {
            return None;
        }
        i += 1;

        if self.tokens.get(i)?.is_punct("<") {
            i = self.skip_angles(i)?;
        }
        if !self.is_open_at(i, '(') {
            return None;
        }

        let close = self.partner[i];
        let sig = self.signature(i + 1, close);
        let body = self.body_after(close + 1);
        Some((name_idx, self.symbol(name, kw, name_idx, sig, body)))
    }

    /// `const name = (params) => ...` and `const name = function (params) {...}`
    fn arrow_function(&self, kw: usize) -> Option<(usize, FunctionSymbol)> {
        let name_idx = kw + 1;
        let name = self.tokens.get(name_idx)?.ident()?;
        if !self.tokens.get(kw + 2)?.is_punct("=") {
            return None;
        }

        let mut open = kw + 3;
        if self.tokens.get(open)?.is_ident("async") {
            open += 1;
        }
        if self.tokens.get(open)?.is_ident("function") {
            open += 1;
            if !self.is_open_at(open, '(') {
                return None;
            }
            let close = self.partner[open];
            let sig = self.signature(open + 1, close);
            let body = self.body_after(close + 1);
            return Some((name_idx, self.symbol(name, kw, name_idx, sig, body)));
        }
        if !self.is_open_at(open, '(') {
            return None;
        }

        let close = self.partner[open];
        let mut j = close + 1;
        // Optional return type annotation before the arrow
        while let Some(t) = self.tokens.get(j) {
            match &t.tok {
                Tok::Punct(p) if p == "=>" => break,
                Tok::Punct(p) if matches!(p.as_str(), ":" | "<" | ">" | "|" | "." | "?") => j += 1,
                Tok::Ident(_) => j += 1,
                Tok::Open('[') => j = self.partner[j] + 1,
                _ => return None,
            }
        }
        if !self.tokens.get(j)?.is_punct("=>") {
            return None;
        }

        let sig = self.signature(open + 1, close);
        let body = self.is_open_at(j + 1, '{').then(|| self.partner[j + 1]);
        Some((name_idx, self.symbol(name, kw, name_idx, sig, body)))
    }

    /// `Type name(params) {` definitions and `Type name(params);` prototypes
    fn c_style_function(&self, i: usize) -> Option<(usize, FunctionSymbol)> {
        let name = self.tokens[i].ident()?;
        if i == 0 || is_keyword(name) || !self.is_open_at(i + 1, '(') {
            return None;
        }

        let prev = &self.tokens[i - 1];
        let typeish = match &prev.tok {
            Tok::Ident(word) => !is_keyword(word) || word == "static" || word == "const",
            Tok::Punct(p) => matches!(p.as_str(), "*" | "&" | ">" | "::" | "~"),
            _ => false,
        };
        if !typeish {
            return None;
        }

        let close = self.partner[i + 1];
        let body = self.body_after(close + 1);
        let prototype = self.tokens.get(close + 1).is_some_and(|t| t.is_punct(";"));
        if body.is_none() && (!prototype || prev.is_punct("::")) {
            return None;
        }

        let sig = self.signature(i + 2, close);
        Some((i, self.symbol(name, i, i, sig, body)))
    }

    fn skip_angles(&self, open: usize) -> Option<usize> {
        let mut depth = 0usize;
        let mut j = open;
        while let Some(t) = self.tokens.get(j) {
            match &t.tok {
                Tok::Punct(p) if p == "<" => depth += 1,
                Tok::Punct(p) if p == ">" => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return Some(j + 1);
                    }
                }
                Tok::Punct(p) if p == ";" => return None,
                Tok::Open('{') => return None,
                Tok::Open(_) => {
                    j = self.partner[j] + 1;
                    continue;
                }
                _ => {}
            }
            j += 1;
        }
        None
    }

    /// Closing brace of the body that follows a parameter list, if any
    fn body_after(&self, from: usize) -> Option<usize> {
        let mut j = from;
        while let Some(t) = self.tokens.get(j) {
            match &t.tok {
                Tok::Open('{') => return Some(self.partner[j]),
                Tok::Open(_) => j = self.partner[j] + 1,
                Tok::Close(_) => return None,
                Tok::Punct(p) if p == ";" || p == "=" => return None,
                _ => j += 1,
            }
        }
        None
    }

    fn symbol(
        &self,
        name: &str,
        decl: usize,
        name_idx: usize,
        sig: Signature,
        body: Option<usize>,
    ) -> FunctionSymbol {
        let start = self.tokens[decl].line;
        let end = body.map_or(self.tokens[name_idx].line, |close| self.tokens[close].line);

        FunctionSymbol {
            name: name.to_string(),
            min_arity: sig.required,
            max_arity: (!sig.variadic).then_some(sig.required + sig.optional),
            lines: start..end + 1,
            depth: self.depth[decl],
            is_method: sig.receiver,
        }
    }

    fn signature(&self, start: usize, end: usize) -> Signature {
        let mut sig = Signature::default();
        let params = self.split_args(start, end, true);
        let lone = params.len() == 1;

        for range in params {
            let param = &self.tokens[range];
            if param.is_empty() {
                continue;
            }
            if self.language == Language::Rust && is_receiver(param) {
                sig.receiver = true;
                continue;
            }
            if param.iter().any(|t| t.is_punct("...")) {
                sig.variadic = true;
                continue;
            }
            if lone
                && matches!(self.language, Language::C | Language::Cpp)
                && param.len() == 1
                && param[0].is_ident("void")
            {
                continue;
            }

            let defaulted = param.iter().any(|t| t.is_punct("="));
            let optional_mark = self.language == Language::TypeScript
                && param.get(1).is_some_and(|t| t.is_punct("?"));
            if defaulted || optional_mark {
                sig.optional += 1;
            } else {
                sig.required += 1;
            }
        }
        sig
    }

    /// Split `start..end` at top-level commas.
    /// Angle brackets group in signatures, and in arguments only after a type name.
    fn split_args(&self, start: usize, end: usize, in_signature: bool) -> Vec<Range<usize>> {
        let mut parts = Vec::new();
        let mut from = start;
        let mut angles = 0usize;
        let mut j = start;

        while j < end {
            let token = &self.tokens[j];
            match &token.tok {
                Tok::Open(_) => {
                    j = self.partner[j] + 1;
                    continue;
                }
                Tok::Punct(p) if p == "," && angles == 0 => {
                    parts.push(from..j);
                    from = j + 1;
                }
                Tok::Punct(p) if p == "<" && (in_signature || self.opens_generic(j)) => {
                    angles += 1;
                }
                Tok::Punct(p) if p == ">" && angles > 0 => angles -= 1,
                Tok::Punct(p)
                    if p == "|"
                        && !in_signature
                        && self.language == Language::Rust
                        && (j == from || (j == from + 1 && self.tokens[from].is_ident("move"))) =>
                {
                    // Closure parameters
                    if let Some(k) = (j + 1..end).find(|&k| self.tokens[k].is_punct("|")) {
                        j = k + 1;
                        continue;
                    }
                }
                _ => {}
            }
            j += 1;
        }

        if from < end {
            parts.push(from..end);
        }
        parts
    }

    fn opens_generic(&self, j: usize) -> bool {
        if j == 0 {
            return false;
        }
        match &self.tokens[j - 1].tok {
            Tok::Punct(p) => p == "::",
            Tok::Ident(word) => word.chars().next().is_some_and(char::is_uppercase),
            _ => false,
        }
    }

    fn calls(&self, declared: &HashSet<usize>) -> Vec<CallSite> {
        let mut calls = Vec::new();

        for (i, token) in self.tokens.iter().enumerate() {
            let Some(name) = token.ident() else {
                continue;
            };
            if is_keyword(name) || declared.contains(&i) || !self.is_open_at(i + 1, '(') {
                continue;
            }
            if i > 0 {
                let prev = &self.tokens[i - 1];
                let qualified = prev.is_punct(".") || prev.is_punct("->") || prev.is_punct("::");
                if qualified || prev.is_ident("new") {
                    continue;
                }
            }

            let close = self.partner[i + 1];
            calls.push(CallSite {
                name: name.to_string(),
                args: self.split_args(i + 2, close, false).len(),
                line: token.line,
                col: token.col,
            });
        }
        calls
    }
}

fn is_receiver(param: &[Token]) -> bool {
    let words: Vec<&Token> = param
        .iter()
        .filter(|t| !t.is_punct("&") && !t.is_ident("mut") && t.tok != Tok::Literal)
        .collect();
    words.first().is_some_and(|t| t.is_ident("self"))
        && (words.len() == 1 || words[1].is_punct(":"))
}

/// Parser for one brace language
#[derive(Debug, Clone, Copy)]
pub struct BraceBackend {
    language: Language,
}

impl BraceBackend {
    pub fn new(language: Language) -> Self {
        Self { language }
    }

    fn analyze(&self, text: &str) -> ParseResult {
        let tokens = Lexer::new(text, self.language).run()?;
        let partner = match_delimiters(&tokens)?;
        let analyzer = Analyzer::new(&tokens, &partner, self.language);

        let items = analyzer.items();
        let (functions, declared) = analyzer.functions();
        let calls = analyzer.calls(&declared);

        Ok(SyntaxTree {
            language: self.language,
            line_count: line_count(text),
            items,
            symbols: SymbolTable { functions, calls },
        })
    }
}

impl LanguageBackend for BraceBackend {
    fn language(&self) -> Language {
        self.language
    }

    fn parse(&self, text: &str) -> ParseResult {
        self.analyze(text)
    }

    /// Re-parses only the enclosing block item when the edit stays strictly
    /// inside it; otherwise parses the whole file
    fn incremental_parse(&self, prior: &SyntaxTree, text: &str, edit: &EditSpan) -> ParseResult {
        let delta = edit.delta();
        if prior.line_count as isize + delta != line_count(text) as isize {
            return self.parse(text);
        }

        let Some(index) = prior.items.iter().position(|item| {
            item.is_block && item.lines.start < edit.start && edit.old_end < item.lines.end
        }) else {
            return self.parse(text);
        };

        let old_lines = prior.items[index].lines.clone();
        let new_lines = old_lines.start..shift(old_lines.end, delta);
        let fragment = text
            .split('\n')
            .skip(new_lines.start)
            .take(new_lines.len())
            .collect::<Vec<_>>()
            .join("\n");

        let mut reparsed = match self.analyze(&fragment) {
            Ok(tree) if tree.items.len() == 1 && tree.items[0].is_block => tree,
            _ => return self.parse(text),
        };
        debug!(language = %self.language, lines = ?new_lines, "incremental re-parse");

        let offset = new_lines.start as isize;
        reparsed.symbols.shift_lines(offset);

        let before = |line: usize| line < old_lines.start;
        let after = |line: usize| line >= old_lines.end;

        let mut items: Vec<ItemSpan> = Vec::with_capacity(prior.items.len());
        items.extend(prior.items[..index].iter().cloned());
        items.extend(reparsed.items.iter().map(|item| ItemSpan {
            lines: shift_range(&item.lines, offset),
            is_block: item.is_block,
        }));
        items.extend(prior.items[index + 1..].iter().map(|item| ItemSpan {
            lines: shift_range(&item.lines, delta),
            is_block: item.is_block,
        }));

        let mut trailing = SymbolTable {
            functions: prior
                .symbols
                .functions
                .iter()
                .filter(|f| after(f.lines.start))
                .cloned()
                .collect(),
            calls: prior
                .symbols
                .calls
                .iter()
                .filter(|c| after(c.line))
                .cloned()
                .collect(),
        };
        trailing.shift_lines(delta);

        let mut symbols = SymbolTable {
            functions: prior
                .symbols
                .functions
                .iter()
                .filter(|f| before(f.lines.start))
                .cloned()
                .collect(),
            calls: prior
                .symbols
                .calls
                .iter()
                .filter(|c| before(c.line))
                .cloned()
                .collect(),
        };
        symbols.functions.extend(reparsed.symbols.functions);
        symbols.calls.extend(reparsed.symbols.calls);
        symbols.functions.extend(trailing.functions);
        symbols.calls.extend(trailing.calls);

        Ok(SyntaxTree {
            language: self.language,
            line_count: line_count(text),
            items,
            symbols,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rust() -> BraceBackend {
        BraceBackend::new(Language::Rust)
    }

    fn function<'t>(tree: &'t SyntaxTree, name: &str) -> &'t FunctionSymbol {
        tree.symbols
            .functions
            .iter()
            .find(|f| f.name == name)
            .unwrap_or_else(|| panic!("no function {}", name))
    }

    #[test]
    fn test_rust_functions_and_arity() {
        let source = r#"
use std::collections::HashMap;

pub fn lookup<K: Eq, V>(map: &HashMap<K, V>, key: K) -> Option<&V> {
    map.get(&key)
}

impl Counter {
    fn bump(&mut self, by: u32) {
        self.total += by;
    }
}
"#;
        let tree = rust().parse(source).unwrap();

        let lookup = function(&tree, "lookup");
        assert_eq!((lookup.min_arity, lookup.max_arity), (2, Some(2)));
        assert_eq!(lookup.lines, 3..6);
        assert_eq!(lookup.depth, 0);

        let bump = function(&tree, "bump");
        assert!(bump.is_method);
        assert_eq!(bump.min_arity, 1);
        assert_eq!(bump.depth, 1);
    }

    #[test]
    fn test_bare_calls_only() {
        let source = "fn main() {\n    let v = parse(input, |a, b| a + b);\n    v.render(1, 2);\n    Config::load();\n    println!(\"{}\", total(v));\n}\n";
        let tree = rust().parse(source).unwrap();

        let calls: Vec<(&str, usize)> = tree
            .symbols
            .calls
            .iter()
            .map(|c| (c.name.as_str(), c.args))
            .collect();
        assert_eq!(calls, vec![("parse", 2), ("total", 1)]);
        assert_eq!(tree.symbols.calls[0].line, 1);
    }

    #[test]
    fn test_literals_and_comments_hide_delimiters() {
        let source = r##"
fn tricky<'a>(s: &'a str) -> char {
    // unmatched { in a comment
    /* nested /* { */ still comment */
    let raw = r#"{ "quoted" }"#;
    let text = "(";
    if s.is_empty() { '{' } else { '}' }
}
"##;
        assert!(rust().parse(source).is_ok());
    }

    #[test]
    fn test_unclosed_delimiter_reports_open_location() {
        let source = "fn broken() {\n    if ready {\n        go();\n}\n";
        let errors = rust().parse(source).unwrap_err();

        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].line, 0);
        assert!(errors[0].message.contains("unclosed"));
    }

    #[test]
    fn test_mismatched_and_unterminated() {
        let errors = rust().parse("fn f() { (1, 2] }").unwrap_err();
        assert!(errors[0].message.contains("mismatched"));

        let errors = BraceBackend::new(Language::C)
            .parse("int main() {\n  puts(\"oops);\n}\n")
            .unwrap_err();
        assert_eq!(errors[0].line, 1);
        assert!(errors[0].message.contains("unterminated"));
    }

    #[test]
    fn test_c_prototypes_and_variadics() {
        let source = "#include <stdio.h>\nint add(int a, int b);\nvoid log_all(const char *fmt, ...);\nint zero(void) { return 0; }\nint add(int a, int b) {\n  return a + b;\n}\n";
        let tree = BraceBackend::new(Language::C).parse(source).unwrap();

        assert_eq!(tree.symbols.functions_named("add").count(), 2);
        let log_all = function(&tree, "log_all");
        assert_eq!((log_all.min_arity, log_all.max_arity), (1, None));
        assert_eq!(function(&tree, "zero").max_arity, Some(0));
    }

    #[test]
    fn test_javascript_function_forms() {
        let source = "function greet(name, greeting = 'hi') {\n  return `${greeting} ${name}`;\n}\nconst sum = (a, b) => a + b;\nconst later = async function (cb) {\n  cb();\n};\n";
        let tree = BraceBackend::new(Language::JavaScript).parse(source).unwrap();

        let greet = function(&tree, "greet");
        assert_eq!((greet.min_arity, greet.max_arity), (1, Some(2)));
        assert_eq!(function(&tree, "sum").min_arity, 2);
        assert_eq!(function(&tree, "later").lines, 4..7);
    }

    #[test]
    fn test_incremental_parse_matches_full_parse() {
        let before = "fn a() {\n    one();\n}\n\nfn b(x: u8) {\n    two(x);\n}\n\nfn c() {\n    b(1);\n}\n";
        let after = "fn a() {\n    one();\n}\n\nfn b(x: u8) {\n    two(x);\n    three(x, x);\n}\n\nfn c() {\n    b(1);\n}\n";

        let prior = rust().parse(before).unwrap();
        let edit = EditSpan {
            start: 6,
            old_end: 6,
            new_end: 7,
        };
        let incremental = rust().incremental_parse(&prior, after, &edit).unwrap();
        let full = rust().parse(after).unwrap();

        assert_eq!(incremental, full);
    }

    #[test]
    fn test_incremental_parse_falls_back_on_breakage() {
        let before = "fn a() {\n    one();\n}\n";
        let after = "fn a() {\n    one(;\n}\n";

        let prior = rust().parse(before).unwrap();
        let edit = EditSpan {
            start: 1,
            old_end: 2,
            new_end: 2,
        };
        let errors = rust().incremental_parse(&prior, after, &edit).unwrap_err();
        assert_eq!(errors[0].line, 2);
    }
}
