//! Kernel-source front end.
//!
//! Extracts `__kernel` entry-point signatures from OpenCL C text and runs the
//! front-end checks the reference driver uses as its compiler: lexical
//! errors, conditional directives with `#error`, delimiter balance and
//! unknown parameter types. Diagnostics are rendered clang-style as
//! `<source>:LINE:COL: error: message`.

use std::collections::{HashMap, HashSet};
use std::fmt;

// ── Types ───────────────────────────────────────────────────────────────────

/// Scalar parameter type of a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    Char,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    Half,
    Float,
    Double,
    SizeT,
}

impl ScalarType {
    pub fn size(self) -> usize {
        match self {
            Self::Char | Self::UChar => 1,
            Self::Short | Self::UShort | Self::Half => 2,
            Self::Int | Self::UInt | Self::Float => 4,
            Self::Long | Self::ULong | Self::Double | Self::SizeT => 8,
        }
    }

    fn from_type_name(name: &str) -> Option<Self> {
        Some(match name {
            "char" | "signed char" => Self::Char,
            "uchar" | "unsigned char" => Self::UChar,
            "short" | "signed short" => Self::Short,
            "ushort" | "unsigned short" => Self::UShort,
            "int" | "signed int" | "signed" => Self::Int,
            "uint" | "unsigned int" | "unsigned" => Self::UInt,
            "long" | "signed long" => Self::Long,
            "ulong" | "unsigned long" => Self::ULong,
            "half" => Self::Half,
            "float" => Self::Float,
            "double" => Self::Double,
            "size_t" => Self::SizeT,
            _ => return None,
        })
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Char => "char",
            Self::UChar => "uchar",
            Self::Short => "short",
            Self::UShort => "ushort",
            Self::Int => "int",
            Self::UInt => "uint",
            Self::Long => "long",
            Self::ULong => "ulong",
            Self::Half => "half",
            Self::Float => "float",
            Self::Double => "double",
            Self::SizeT => "size_t",
        };
        write!(f, "{name}")
    }
}

/// Address space of a pointer parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressSpace {
    Global,
    Constant,
    Local,
    Private,
}

/// Declared kind of a kernel parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamKind {
    /// `__global` or `__constant` pointer bound to a device buffer.
    Buffer { element: String, address_space: AddressSpace, is_const: bool },
    /// `__local` pointer sized at bind time.
    Local { element: String },
    Scalar(ScalarType),
    /// Anything else (vectors, images, structs). Accepts any argument.
    Opaque { type_name: String },
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffer { element, address_space: AddressSpace::Constant, .. } => {
                write!(f, "__constant {element}*")
            }
            Self::Buffer { element, is_const: true, .. } => write!(f, "__global const {element}*"),
            Self::Buffer { element, .. } => write!(f, "__global {element}*"),
            Self::Local { element } => write!(f, "__local {element}*"),
            Self::Scalar(ty) => write!(f, "{ty}"),
            Self::Opaque { type_name } => write!(f, "{type_name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelParam {
    pub name: String,
    pub kind: ParamKind,
}

/// Declared entry point of a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSignature {
    pub name: String,
    pub params: Vec<KernelParam>,
    /// 1-based source line of the `__kernel` keyword, 0 when not parsed from source.
    pub line: usize,
}

impl KernelSignature {
    /// Signature with `arity` untyped parameters, used when the source could
    /// not be parsed but the driver reports the argument count.
    pub fn opaque(name: &str, arity: usize) -> Self {
        let params = (0..arity)
            .map(|i| KernelParam { name: format!("arg{i}"), kind: ParamKind::Opaque { type_name: "?".into() } })
            .collect();
        Self { name: name.to_string(), params, line: 0 }
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

/// A front-end error with its source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub line: usize,
    pub col: usize,
    pub message: String,
}

impl Diagnostic {
    fn new(line: usize, col: usize, message: impl Into<String>) -> Self {
        Self { line, col, message: message.into() }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line == 0 {
            return write!(f, "error: {}", self.message);
        }
        write!(f, "<source>:{}:{}: error: {}", self.line, self.col, self.message)
    }
}

/// Result of running the front end over a source text.
#[derive(Debug, Clone, Default)]
pub struct FrontEnd {
    pub kernels: Vec<KernelSignature>,
    pub diagnostics: Vec<Diagnostic>,
}

impl FrontEnd {
    pub fn is_ok(&self) -> bool {
        self.diagnostics.is_empty()
    }

    /// Diagnostics joined one per line.
    pub fn log(&self) -> String {
        self.diagnostics.iter().map(ToString::to_string).collect::<Vec<_>>().join("\n")
    }
}

// ── Lexer ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Ident,
    Number,
    Punct,
    Literal,
    Directive,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    text: String,
    line: usize,
    col: usize,
}

impl Token {
    fn is_punct(&self, c: &str) -> bool {
        self.kind == TokenKind::Punct && self.text == c
    }

    fn is_ident(&self, s: &str) -> bool {
        self.kind == TokenKind::Ident && self.text == s
    }
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    col: usize,
    at_line_start: bool,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self { chars: source.chars().peekable(), line: 1, col: 1, at_line_start: true }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
            self.at_line_start = true;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn run(mut self) -> Result<Vec<Token>, Diagnostic> {
        let mut tokens = Vec::new();
        while let Some(&c) = self.chars.peek() {
            let (line, col) = (self.line, self.col);
            if c == '\n' {
                self.bump();
                continue;
            }
            if c.is_whitespace() {
                self.bump();
                continue;
            }
            if c == '#' && self.at_line_start {
                tokens.push(Token { kind: TokenKind::Directive, text: self.directive(), line, col });
                continue;
            }
            self.at_line_start = false;
            if c == '/' {
                self.bump();
                match self.chars.peek() {
                    Some('/') => {
                        while let Some(&n) = self.chars.peek() {
                            if n == '\n' {
                                break;
                            }
                            self.bump();
                        }
                    }
                    Some('*') => {
                        self.bump();
                        let mut prev = '\0';
                        loop {
                            match self.bump() {
                                Some('/') if prev == '*' => break,
                                Some(n) => prev = n,
                                None => return Err(Diagnostic::new(line, col, "unterminated /* comment")),
                            }
                        }
                        // a block comment does not end the logical line start
                        self.at_line_start = false;
                    }
                    _ => tokens.push(Token { kind: TokenKind::Punct, text: "/".into(), line, col }),
                }
                continue;
            }
            if c == '"' || c == '\'' {
                self.bump();
                let mut text = String::new();
                loop {
                    match self.bump() {
                        Some('\\') => {
                            if let Some(n) = self.bump() {
                                text.push(n);
                            }
                        }
                        Some(n) if n == c => break,
                        Some('\n') | None => {
                            let what = if c == '"' { "string literal" } else { "character constant" };
                            return Err(Diagnostic::new(line, col, format!("missing terminating {c} in {what}")));
                        }
                        Some(n) => text.push(n),
                    }
                }
                tokens.push(Token { kind: TokenKind::Literal, text, line, col });
                continue;
            }
            if c.is_ascii_alphabetic() || c == '_' {
                let mut text = String::new();
                while let Some(&n) = self.chars.peek() {
                    if n.is_ascii_alphanumeric() || n == '_' {
                        text.push(n);
                        self.bump();
                    } else {
                        break;
                    }
                }
                tokens.push(Token { kind: TokenKind::Ident, text, line, col });
                continue;
            }
            if c.is_ascii_digit() {
                let mut text = String::new();
                while let Some(&n) = self.chars.peek() {
                    if n.is_ascii_alphanumeric() || n == '.' || n == '_' {
                        text.push(n);
                        self.bump();
                    } else {
                        break;
                    }
                }
                tokens.push(Token { kind: TokenKind::Number, text, line, col });
                continue;
            }
            self.bump();
            tokens.push(Token { kind: TokenKind::Punct, text: c.to_string(), line, col });
        }
        Ok(tokens)
    }

    /// Rest of a `#` line, honouring backslash continuations.
    fn directive(&mut self) -> String {
        self.bump();
        let mut text = String::new();
        while let Some(&c) = self.chars.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
            if c == '\\' && self.chars.peek() == Some(&'\n') {
                self.bump();
                text.push(' ');
                continue;
            }
            text.push(c);
        }
        text.trim().to_string()
    }
}

// ── Preprocessor ────────────────────────────────────────────────────────────

struct Conditional {
    /// Whether the enclosing region is active.
    parent_active: bool,
    /// Whether any branch of this conditional has been taken.
    taken: bool,
    active: bool,
    line: usize,
    col: usize,
}

fn eval_condition(expr: &str, defines: &HashMap<String, String>) -> bool {
    let expr = expr.trim();
    if let Some(rest) = expr.strip_prefix('!') {
        return !eval_condition(rest, defines);
    }
    if let Some(rest) = expr.strip_prefix("defined") {
        let name = rest.trim().trim_start_matches('(').trim_end_matches(')').trim();
        return defines.contains_key(name);
    }
    let value = defines.get(expr).map(String::as_str).unwrap_or(expr);
    match value.parse::<i64>() {
        Ok(n) => n != 0,
        Err(_) => false,
    }
}

/// Evaluate conditional directives, returning the active non-directive tokens.
fn preprocess(
    tokens: Vec<Token>,
    mut defines: HashMap<String, String>,
    diagnostics: &mut Vec<Diagnostic>,
) -> Vec<Token> {
    let mut stack: Vec<Conditional> = Vec::new();
    let mut out = Vec::new();
    let active = |stack: &[Conditional]| stack.last().map_or(true, |c| c.active);

    for token in tokens {
        if token.kind != TokenKind::Directive {
            if active(&stack) {
                out.push(token);
            }
            continue;
        }
        let (keyword, rest) = match token.text.split_once(char::is_whitespace) {
            Some((k, r)) => (k, r.trim()),
            None => (token.text.as_str(), ""),
        };
        let here = active(&stack);
        match keyword {
            "ifdef" | "ifndef" | "if" => {
                let cond = match keyword {
                    "ifdef" => defines.contains_key(rest),
                    "ifndef" => !defines.contains_key(rest),
                    _ => eval_condition(rest, &defines),
                };
                stack.push(Conditional {
                    parent_active: here,
                    taken: cond,
                    active: here && cond,
                    line: token.line,
                    col: token.col,
                });
            }
            "elif" | "else" => match stack.last_mut() {
                Some(top) => {
                    let cond = keyword == "else" || eval_condition(rest, &defines);
                    top.active = top.parent_active && !top.taken && cond;
                    top.taken |= cond;
                }
                None => diagnostics.push(Diagnostic::new(token.line, token.col, format!("#{keyword} without #if"))),
            },
            "endif" => {
                if stack.pop().is_none() {
                    diagnostics.push(Diagnostic::new(token.line, token.col, "#endif without #if"));
                }
            }
            _ if !here => {}
            "define" => {
                let (name, value) = match rest.split_once(char::is_whitespace) {
                    Some((n, v)) => (n, v.trim()),
                    None => (rest, "1"),
                };
                let name = name.split('(').next().unwrap_or(name);
                defines.insert(name.to_string(), value.to_string());
            }
            "undef" => {
                defines.remove(rest);
            }
            "error" => diagnostics.push(Diagnostic::new(token.line, token.col, format!("\"{rest}\""))),
            "pragma" | "include" | "line" | "warning" | "" => {}
            other => diagnostics.push(Diagnostic::new(
                token.line,
                token.col,
                format!("invalid preprocessing directive '#{other}'"),
            )),
        }
    }

    for open in stack {
        diagnostics.push(Diagnostic::new(open.line, open.col, "unterminated conditional directive"));
    }
    out
}

// ── Delimiters ──────────────────────────────────────────────────────────────

fn check_delimiters(tokens: &[Token], diagnostics: &mut Vec<Diagnostic>) {
    let mut stack: Vec<&Token> = Vec::new();
    for token in tokens.iter().filter(|t| t.kind == TokenKind::Punct) {
        match token.text.as_str() {
            "(" | "[" | "{" => stack.push(token),
            close @ (")" | "]" | "}") => {
                let expected = match close {
                    ")" => "(",
                    "]" => "[",
                    _ => "{",
                };
                match stack.pop() {
                    Some(open) if open.text == expected => {}
                    Some(open) => {
                        diagnostics.push(Diagnostic::new(
                            token.line,
                            token.col,
                            format!("expected '{}' to match '{}' at {}:{}", closing(&open.text), open.text, open.line, open.col),
                        ));
                        return;
                    }
                    None => {
                        diagnostics.push(Diagnostic::new(token.line, token.col, format!("extraneous closing '{close}'")));
                        return;
                    }
                }
            }
            _ => {}
        }
    }
    if let Some(open) = stack.last() {
        diagnostics.push(Diagnostic::new(open.line, open.col, format!("unmatched '{}'", open.text)));
    }
}

fn closing(open: &str) -> &'static str {
    match open {
        "(" => ")",
        "[" => "]",
        _ => "}",
    }
}

// ── Signatures ──────────────────────────────────────────────────────────────

const QUALIFIERS: &[&str] = &[
    "const", "volatile", "restrict", "__restrict", "__read_only", "read_only", "__write_only", "write_only",
    "__read_write", "read_write", "__private", "private", "struct", "union", "enum",
];

const BUILTIN_TYPES: &[&str] = &[
    "bool", "char", "uchar", "short", "ushort", "int", "uint", "long", "ulong", "half", "float", "double",
    "size_t", "ptrdiff_t", "intptr_t", "uintptr_t", "void", "sampler_t", "event_t", "image1d_t", "image1d_array_t",
    "image1d_buffer_t", "image2d_t", "image2d_array_t", "image2d_depth_t", "image3d_t", "queue_t", "unsigned",
    "signed",
];

fn is_known_type(name: &str, user_types: &HashSet<String>) -> bool {
    if BUILTIN_TYPES.contains(&name) || user_types.contains(name) {
        return true;
    }
    // vector types: float4, uchar16, ...
    let base = name.trim_end_matches(|c: char| c.is_ascii_digit());
    let width = &name[base.len()..];
    matches!(width, "2" | "3" | "4" | "8" | "16") && BUILTIN_TYPES.contains(&base)
}

/// Names introduced by `typedef ... NAME;` and `struct NAME`.
fn user_types(tokens: &[Token]) -> HashSet<String> {
    let mut names = HashSet::new();
    let mut i = 0;
    while i < tokens.len() {
        if tokens[i].is_ident("struct") || tokens[i].is_ident("union") || tokens[i].is_ident("enum") {
            if let Some(next) = tokens.get(i + 1).filter(|t| t.kind == TokenKind::Ident) {
                names.insert(next.text.clone());
            }
        }
        if tokens[i].is_ident("typedef") {
            let mut depth = 0usize;
            let mut last_ident = None;
            let mut j = i + 1;
            while j < tokens.len() {
                let t = &tokens[j];
                if t.is_punct("{") || t.is_punct("(") {
                    depth += 1;
                } else if t.is_punct("}") || t.is_punct(")") {
                    depth = depth.saturating_sub(1);
                } else if t.is_punct(";") && depth == 0 {
                    break;
                } else if t.kind == TokenKind::Ident && depth == 0 {
                    last_ident = Some(t.text.clone());
                }
                j += 1;
            }
            if let Some(name) = last_ident {
                names.insert(name);
            }
            i = j;
        }
        i += 1;
    }
    names
}

fn parse_param(tokens: &[Token], index: usize, user_types: &HashSet<String>, diagnostics: &mut Vec<Diagnostic>) -> KernelParam {
    let mut address_space = AddressSpace::Private;
    let mut is_const = false;
    let mut pointer = false;
    let mut words: Vec<&Token> = Vec::new();

    for t in tokens {
        match t.text.as_str() {
            "__global" | "global" => address_space = AddressSpace::Global,
            "__constant" | "constant" => address_space = AddressSpace::Constant,
            "__local" | "local" => address_space = AddressSpace::Local,
            "const" => is_const = true,
            "*" => pointer = true,
            s if QUALIFIERS.contains(&s) => {}
            _ if t.kind == TokenKind::Ident => words.push(t),
            _ => {}
        }
    }

    // last identifier is the parameter name when more than one word is present
    let (name, type_words) = match words.split_last() {
        Some((last, rest)) if !rest.is_empty() => (last.text.clone(), rest.to_vec()),
        _ => (format!("arg{index}"), words.clone()),
    };
    let type_name = type_words.iter().map(|t| t.text.as_str()).collect::<Vec<_>>().join(" ");

    if type_words.is_empty() {
        if let Some(t) = tokens.first() {
            diagnostics.push(Diagnostic::new(t.line, t.col, "expected parameter declarator"));
        }
    }
    for word in &type_words {
        if !is_known_type(&word.text, user_types) {
            diagnostics.push(Diagnostic::new(word.line, word.col, format!("unknown type name '{}'", word.text)));
        }
    }

    let kind = if pointer {
        match address_space {
            AddressSpace::Local => ParamKind::Local { element: type_name },
            AddressSpace::Constant => ParamKind::Buffer { element: type_name, address_space, is_const: true },
            _ => ParamKind::Buffer { element: type_name, address_space: AddressSpace::Global, is_const },
        }
    } else {
        match ScalarType::from_type_name(&type_name) {
            Some(ty) => ParamKind::Scalar(ty),
            None => ParamKind::Opaque { type_name },
        }
    };
    KernelParam { name, kind }
}

fn skip_attributes(tokens: &[Token], mut i: usize) -> usize {
    while tokens.get(i).is_some_and(|t| t.is_ident("__attribute__")) {
        i += 1;
        let mut depth = 0usize;
        while let Some(t) = tokens.get(i) {
            i += 1;
            if t.is_punct("(") {
                depth += 1;
            } else if t.is_punct(")") {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    break;
                }
            }
        }
    }
    i
}

fn parse_kernels(tokens: &[Token], diagnostics: &mut Vec<Diagnostic>) -> Vec<KernelSignature> {
    let user_types = user_types(tokens);
    let mut kernels = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let t = &tokens[i];
        if !(t.is_ident("__kernel") || t.is_ident("kernel")) {
            i += 1;
            continue;
        }
        let line = t.line;
        let mut j = skip_attributes(tokens, i + 1);
        match tokens.get(j) {
            Some(ret) if ret.is_ident("void") => j += 1,
            Some(ret) => {
                diagnostics.push(Diagnostic::new(ret.line, ret.col, "kernel must have void return type"));
                i = j + 1;
                continue;
            }
            None => break,
        }
        let Some(name) = tokens.get(j).filter(|n| n.kind == TokenKind::Ident) else {
            i = j;
            continue;
        };
        if !tokens.get(j + 1).is_some_and(|p| p.is_punct("(")) {
            i = j + 1;
            continue;
        }

        let mut params = Vec::new();
        let mut current: Vec<Token> = Vec::new();
        let mut depth = 0usize;
        let mut k = j + 2;
        while let Some(tok) = tokens.get(k) {
            k += 1;
            if tok.is_punct("(") {
                depth += 1;
            } else if tok.is_punct(")") {
                if depth == 0 {
                    break;
                }
                depth -= 1;
            } else if tok.is_punct(",") && depth == 0 {
                params.push(std::mem::take(&mut current));
                continue;
            }
            current.push(tok.clone());
        }
        let only_void = current.len() == 1 && current[0].is_ident("void") && params.is_empty();
        if !current.is_empty() && !only_void {
            params.push(current);
        }

        let params = params
            .iter()
            .enumerate()
            .map(|(idx, p)| parse_param(p, idx, &user_types, diagnostics))
            .collect();
        kernels.push(KernelSignature { name: name.text.clone(), params, line });
        i = k;
    }
    kernels
}

// ── Entry points ────────────────────────────────────────────────────────────

/// Parse `-D NAME[=VALUE]` options into a define table.
fn defines_from_options(options: &str) -> Result<HashMap<String, String>, String> {
    let mut defines = HashMap::new();
    let mut words = options.split_whitespace();
    while let Some(word) = words.next() {
        let define = if word == "-D" {
            Some(words.next().ok_or_else(|| "missing macro name after '-D'".to_string())?)
        } else {
            word.strip_prefix("-D")
        };
        if let Some(define) = define {
            let (name, value) = define.split_once('=').unwrap_or((define, "1"));
            defines.insert(name.to_string(), value.to_string());
            continue;
        }
        if word == "-I" {
            words.next();
            continue;
        }
        let known = word.starts_with("-cl-") || word.starts_with("-I") || matches!(word, "-w" | "-Werror");
        if !known {
            return Err(format!("unknown build option '{word}'"));
        }
    }
    Ok(defines)
}

/// Check that `options` is a build option string the front end understands.
pub fn validate_options(options: &str) -> Result<(), String> {
    defines_from_options(options).map(|_| ())
}

/// Run the full front end over `source` with the given build options.
pub fn analyze(source: &str, options: &str) -> FrontEnd {
    let mut diagnostics = Vec::new();
    let defines = match defines_from_options(options) {
        Ok(d) => d,
        Err(message) => {
            return FrontEnd { kernels: Vec::new(), diagnostics: vec![Diagnostic::new(0, 0, message)] };
        }
    };
    let tokens = match Lexer::new(source).run() {
        Ok(tokens) => tokens,
        Err(diag) => return FrontEnd { kernels: Vec::new(), diagnostics: vec![diag] },
    };
    let tokens = preprocess(tokens, defines, &mut diagnostics);
    check_delimiters(&tokens, &mut diagnostics);
    let kernels = parse_kernels(&tokens, &mut diagnostics);

    let mut seen = HashSet::new();
    for k in &kernels {
        if !seen.insert(k.name.as_str()) {
            diagnostics.push(Diagnostic::new(k.line, 1, format!("redefinition of kernel '{}'", k.name)));
        }
    }
    FrontEnd { kernels, diagnostics }
}

/// Lenient signature extraction: every kernel the parser can find, ignoring
/// diagnostics.
pub fn parse(source: &str, options: &str) -> Vec<KernelSignature> {
    analyze(source, options).kernels
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROTATE: &str = r#"
// rotate an int image
__kernel void image_rotate(__global int *src_data, __global int *dest_data,
                           int W, int H, float sinTheta, float cosTheta)
{
    const int ix = get_global_id(0);
    const int iy = get_global_id(1);
}
"#;

    #[test]
    fn parses_rotate_signature() {
        let fe = analyze(ROTATE, "");
        assert!(fe.is_ok(), "{}", fe.log());
        assert_eq!(fe.kernels.len(), 1);
        let k = &fe.kernels[0];
        assert_eq!(k.name, "image_rotate");
        assert_eq!(k.line, 3);
        assert_eq!(k.arity(), 6);
        assert_eq!(
            k.params[0].kind,
            ParamKind::Buffer { element: "int".into(), address_space: AddressSpace::Global, is_const: false }
        );
        assert_eq!(k.params[2].kind, ParamKind::Scalar(ScalarType::Int));
        assert_eq!(k.params[5].kind, ParamKind::Scalar(ScalarType::Float));
        assert_eq!(k.params[5].name, "cosTheta");
    }

    #[test]
    fn const_global_and_local_params() {
        let src = "kernel void k(global const float* a, __local float *scratch, __constant uint *lut, float4 v) {}";
        let fe = analyze(src, "");
        assert!(fe.is_ok(), "{}", fe.log());
        let p = &fe.kernels[0].params;
        assert_eq!(p[0].kind, ParamKind::Buffer { element: "float".into(), address_space: AddressSpace::Global, is_const: true });
        assert_eq!(p[1].kind, ParamKind::Local { element: "float".into() });
        assert!(matches!(p[2].kind, ParamKind::Buffer { address_space: AddressSpace::Constant, .. }));
        assert_eq!(p[3].kind, ParamKind::Opaque { type_name: "float4".into() });
    }

    #[test]
    fn void_parameter_list_is_empty() {
        let fe = analyze("__kernel void noop(void) {}", "");
        assert!(fe.is_ok());
        assert_eq!(fe.kernels[0].arity(), 0);
    }

    #[test]
    fn unmatched_brace_is_reported_with_position() {
        let fe = analyze("__kernel void k(__global int *a)\n{\n    a[0] = 1;\n", "");
        assert!(!fe.is_ok());
        assert_eq!(fe.log(), "<source>:2:1: error: unmatched '{'");
    }

    #[test]
    fn mismatched_closer_is_reported() {
        let fe = analyze("__kernel void k(__global int *a) { a[0) = 1; }", "");
        assert!(fe.log().contains("expected ']'"), "{}", fe.log());
    }

    #[test]
    fn unknown_parameter_type() {
        let fe = analyze("__kernel void k(__global flaot *a) {}", "");
        assert!(fe.log().contains("unknown type name 'flaot'"), "{}", fe.log());
    }

    #[test]
    fn typedef_names_are_known() {
        let src = "typedef struct { float x; } point_t;\n__kernel void k(__global point_t *p) {}";
        assert!(analyze(src, "").is_ok());
    }

    #[test]
    fn error_directive_respects_defines() {
        let src = "#ifndef WIDTH\n#error WIDTH must be defined\n#endif\n__kernel void k(void) {}";
        let fe = analyze(src, "");
        assert_eq!(fe.log(), "<source>:2:1: error: \"WIDTH must be defined\"");
        assert!(analyze(src, "-D WIDTH=6").is_ok());
        assert!(analyze(src, "-DWIDTH").is_ok());
    }

    #[test]
    fn comments_and_strings_do_not_count() {
        let src = "/* { */ // (\n__kernel void k(__global char *s) { /* ) */ }";
        assert!(analyze(src, "").is_ok());
    }

    #[test]
    fn unterminated_comment() {
        let fe = analyze("__kernel void k(void) {} /* oops", "");
        assert!(fe.log().contains("unterminated /* comment"));
    }

    #[test]
    fn unknown_build_option_fails() {
        let fe = analyze("__kernel void k(void) {}", "-O9");
        assert!(fe.log().contains("unknown build option '-O9'"));
        assert!(validate_options("-cl-std=CL1.2 -D N=4 -Werror").is_ok());
    }

    #[test]
    fn duplicate_kernel_names() {
        let fe = analyze("__kernel void k(void) {}\n__kernel void k(void) {}", "");
        assert!(fe.log().contains("redefinition of kernel 'k'"));
    }

    #[test]
    fn opaque_signature_has_requested_arity() {
        let sig = KernelSignature::opaque("x", 3);
        assert_eq!(sig.arity(), 3);
        assert!(sig.params.iter().all(|p| matches!(p.kind, ParamKind::Opaque { .. })));
    }
}
