//! Symbol extraction with tree-sitter.
//!
//! Parses one file into the ordered list of callable definitions it
//! contains: top-level functions plus methods one level deep inside impl
//! blocks, classes and Go receiver declarations. Each definition becomes a
//! [`SymbolVersion`] with a parameter-list hash (for "signature changed")
//! and a whole-text hash (for "same symbol, different implementation").
//!
//! Everything that is not a definition is the file's *layout*: imports,
//! constants, type declarations, comments between items. Two versions of a
//! file can be merged per symbol only if at most one side changed the
//! layout.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tree_sitter::{Node, Parser};

use crate::model::types::{Span, SymbolKind, SymbolVersion};

// ---------------------------------------------------------------------------
// Language
// ---------------------------------------------------------------------------

/// Languages with symbol-level analysis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// Rust (`.rs`).
    Rust,
    /// Python (`.py`).
    Python,
    /// TypeScript (`.ts`, `.tsx`, `.mts`, `.cts`).
    #[serde(alias = "ts")]
    TypeScript,
    /// JavaScript (`.js`, `.jsx`, `.mjs`, `.cjs`).
    #[serde(alias = "js")]
    JavaScript,
    /// Go (`.go`).
    Go,
}

impl Language {
    /// Every supported language.
    pub const ALL: [Self; 5] = [
        Self::Rust,
        Self::Python,
        Self::TypeScript,
        Self::JavaScript,
        Self::Go,
    ];

    /// Detect the language from a path's extension.
    #[must_use]
    pub fn from_path(path: &str) -> Option<Self> {
        match Path::new(path).extension()?.to_str()? {
            "rs" => Some(Self::Rust),
            "py" | "pyi" => Some(Self::Python),
            "ts" | "tsx" | "mts" | "cts" => Some(Self::TypeScript),
            "js" | "jsx" | "mjs" | "cjs" => Some(Self::JavaScript),
            "go" => Some(Self::Go),
            _ => None,
        }
    }

    fn grammar(self, path: &str) -> tree_sitter::Language {
        match self {
            Self::Rust => tree_sitter_rust::LANGUAGE.into(),
            Self::Python => tree_sitter_python::LANGUAGE.into(),
            Self::TypeScript if path.ends_with(".tsx") => {
                tree_sitter_typescript::LANGUAGE_TSX.into()
            }
            Self::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
            Self::JavaScript => tree_sitter_javascript::LANGUAGE.into(),
            Self::Go => tree_sitter_go::LANGUAGE.into(),
        }
    }

    const fn member_separator(self) -> &'static str {
        match self {
            Self::Rust => "::",
            Self::Python | Self::TypeScript | Self::JavaScript | Self::Go => ".",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rust => write!(f, "rust"),
            Self::Python => write!(f, "python"),
            Self::TypeScript => write!(f, "typescript"),
            Self::JavaScript => write!(f, "javascript"),
            Self::Go => write!(f, "go"),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a file could not be broken into symbols.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExtractError {
    /// No grammar for this extension, or the language is disabled.
    UnsupportedLanguage {
        /// The file extension, if any.
        extension: Option<String>,
    },
    /// The content is not valid UTF-8.
    NotUtf8,
    /// The parser reported syntax errors.
    Syntax {
        /// 1-based line of the first error.
        line: usize,
        /// 1-based column of the first error.
        column: usize,
    },
    /// The grammar could not be loaded.
    ParserSetup(String),
}

impl fmt::Display for ExtractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedLanguage {
                extension: Some(ext),
            } => write!(f, "unsupported language for .{ext} files"),
            Self::UnsupportedLanguage { extension: None } => {
                write!(f, "unsupported language for files without an extension")
            }
            Self::NotUtf8 => write!(f, "content is not valid UTF-8"),
            Self::Syntax { line, column } => write!(f, "syntax error at {line}:{column}"),
            Self::ParserSetup(msg) => write!(f, "parser setup failed: {msg}"),
        }
    }
}

impl std::error::Error for ExtractError {}

// ---------------------------------------------------------------------------
// ParsedFile
// ---------------------------------------------------------------------------

/// One file version broken into symbols.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedFile {
    /// Detected language.
    pub language: Language,
    /// The file text.
    pub source: String,
    /// Definitions in source order.
    pub symbols: Vec<SymbolVersion>,
}

impl ParsedFile {
    /// Look up a symbol by qualified key.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&SymbolVersion> {
        self.symbols.iter().find(|s| s.name == name)
    }

    /// The full text of a symbol's definition.
    #[must_use]
    pub fn text(&self, symbol: &SymbolVersion) -> &str {
        slice(&self.source, symbol.span.start_byte, symbol.span.end_byte)
    }

    /// Whitespace that precedes `symbol` on its first line.
    #[must_use]
    pub fn indent_of(&self, symbol: &SymbolVersion) -> &str {
        let line_start = self.source[..symbol.span.start_byte.min(self.source.len())]
            .rfind('\n')
            .map_or(0, |i| i + 1);
        let prefix = slice(&self.source, line_start, symbol.span.start_byte);
        if prefix.chars().all(char::is_whitespace) {
            prefix
        } else {
            ""
        }
    }

    /// The non-symbol text, with each line trimmed and blank lines dropped.
    #[must_use]
    pub fn layout(&self) -> String {
        let mut gaps = String::with_capacity(self.source.len());
        let mut cursor = 0;
        for symbol in &self.symbols {
            gaps.push_str(slice(&self.source, cursor, symbol.span.start_byte));
            gaps.push('\n');
            cursor = symbol.span.end_byte;
        }
        gaps.push_str(slice(&self.source, cursor, self.source.len()));
        gaps.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn slice(source: &str, start: usize, end: usize) -> &str {
    source.get(start..end).unwrap_or_default()
}

/// SHA-256 of `bytes` as lowercase hex.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Parse `content` (found at `path`) if its language is in `enabled`.
///
/// # Errors
/// Returns [`ExtractError`] for unsupported languages, non-UTF-8 content
/// and syntax errors.
pub fn extract(
    path: &str,
    content: &[u8],
    enabled: &[Language],
) -> Result<ParsedFile, ExtractError> {
    let language = Language::from_path(path)
        .filter(|l| enabled.contains(l))
        .ok_or_else(|| ExtractError::UnsupportedLanguage {
            extension: Path::new(path)
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_owned),
        })?;
    let source = std::str::from_utf8(content).map_err(|_| ExtractError::NotUtf8)?;
    extract_source(path, language, source)
}

/// Parse `source` as `language`.
///
/// # Errors
/// Returns [`ExtractError::Syntax`] if the parser reports errors.
pub fn extract_source(
    path: &str,
    language: Language,
    source: &str,
) -> Result<ParsedFile, ExtractError> {
    let mut parser = Parser::new();
    parser
        .set_language(&language.grammar(path))
        .map_err(|e| ExtractError::ParserSetup(e.to_string()))?;
    let tree = parser
        .parse(source, None)
        .ok_or_else(|| ExtractError::ParserSetup("parser returned no tree".to_owned()))?;
    let root = tree.root_node();
    if root.has_error() {
        let at = first_error(root).unwrap_or(root).start_position();
        return Err(ExtractError::Syntax {
            line: at.row + 1,
            column: at.column + 1,
        });
    }

    let mut collector = Collector {
        language,
        source,
        found: Vec::new(),
    };
    collector.walk_top_level(root);
    let symbols = collector.finish();

    Ok(ParsedFile {
        language,
        source: source.to_owned(),
        symbols,
    })
}

fn first_error(node: Node<'_>) -> Option<Node<'_>> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    let mut cursor = node.walk();
    let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
    children
        .into_iter()
        .filter(|c| c.has_error() || c.is_missing())
        .find_map(first_error)
}

fn named_children(node: Node<'_>) -> Vec<Node<'_>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor).collect()
}

struct Found {
    name: String,
    kind: SymbolKind,
    signature: String,
    params: String,
    span: Span,
    name_span: (usize, usize),
}

struct Collector<'s> {
    language: Language,
    source: &'s str,
    found: Vec<Found>,
}

impl<'s> Collector<'s> {
    fn text(&self, node: Node<'_>) -> &'s str {
        slice(self.source, node.start_byte(), node.end_byte())
    }

    fn walk_top_level(&mut self, root: Node<'_>) {
        for child in named_children(root) {
            match self.language {
                Language::Rust => self.rust_item(child),
                Language::Python => self.python_item(child, None),
                Language::TypeScript | Language::JavaScript => self.js_item(child, child),
                Language::Go => self.go_item(child),
            }
        }
    }

    // -- Rust --

    fn rust_item(&mut self, node: Node<'_>) {
        match node.kind() {
            "function_item" => self.push(node, node, None, None),
            "impl_item" => {
                let Some(owner) = node
                    .child_by_field_name("type")
                    .map(|t| strip_generics(self.text(t)))
                else {
                    return;
                };
                let Some(body) = node.child_by_field_name("body") else {
                    return;
                };
                for member in named_children(body) {
                    if member.kind() == "function_item" {
                        self.push(member, member, Some(&owner), None);
                    }
                }
            }
            _ => {}
        }
    }

    // -- Python --

    fn python_item(&mut self, node: Node<'_>, owner: Option<&str>) {
        match node.kind() {
            "function_definition" => self.push(node, node, owner, None),
            "decorated_definition" => {
                let Some(def) = node.child_by_field_name("definition") else {
                    return;
                };
                match def.kind() {
                    "function_definition" => self.push(def, node, owner, None),
                    "class_definition" if owner.is_none() => self.python_class(def),
                    _ => {}
                }
            }
            "class_definition" if owner.is_none() => self.python_class(node),
            _ => {}
        }
    }

    fn python_class(&mut self, class: Node<'_>) {
        let Some(name) = class.child_by_field_name("name").map(|n| self.text(n)) else {
            return;
        };
        let Some(body) = class.child_by_field_name("body") else {
            return;
        };
        for member in named_children(body) {
            self.python_item(member, Some(name));
        }
    }

    // -- JavaScript / TypeScript --

    fn js_item(&mut self, node: Node<'_>, outer: Node<'_>) {
        match node.kind() {
            "function_declaration" | "generator_function_declaration" => {
                self.push(node, outer, None, None);
            }
            "class_declaration" | "abstract_class_declaration" => self.js_class(node),
            "export_statement" => {
                if let Some(decl) = node.child_by_field_name("declaration") {
                    self.js_item(decl, node);
                }
            }
            "lexical_declaration" | "variable_declaration" => {
                let declarators: Vec<Node<'_>> = named_children(node)
                    .into_iter()
                    .filter(|d| d.kind() == "variable_declarator")
                    .collect();
                let [declarator] = declarators.as_slice() else {
                    return;
                };
                let Some(value) = declarator.child_by_field_name("value") else {
                    return;
                };
                if matches!(
                    value.kind(),
                    "arrow_function" | "function_expression" | "function" | "generator_function"
                ) {
                    let name = declarator.child_by_field_name("name");
                    self.push(value, outer, None, name);
                }
            }
            _ => {}
        }
    }

    fn js_class(&mut self, class: Node<'_>) {
        let Some(name) = class.child_by_field_name("name").map(|n| self.text(n)) else {
            return;
        };
        let Some(body) = class.child_by_field_name("body") else {
            return;
        };
        for member in named_children(body) {
            if member.kind() == "method_definition" {
                self.push(member, member, Some(name), None);
            }
        }
    }

    // -- Go --

    fn go_item(&mut self, node: Node<'_>) {
        match node.kind() {
            "function_declaration" => self.push(node, node, None, None),
            "method_declaration" => {
                let owner = node
                    .child_by_field_name("receiver")
                    .and_then(|r| {
                        named_children(r)
                            .into_iter()
                            .find(|p| p.kind() == "parameter_declaration")
                    })
                    .and_then(|p| p.child_by_field_name("type"))
                    .map(|t| strip_generics(self.text(t).trim_start_matches('*')));
                if let Some(owner) = owner {
                    self.push(node, node, Some(&owner), None);
                }
            }
            _ => {}
        }
    }

    // -- Shared --

    /// Record one callable. `def` carries the name/parameters/body fields,
    /// `outer` is the node whose text is the whole definition (it includes
    /// decorators, `export`, or the `const` binding).
    fn push(
        &mut self,
        def: Node<'_>,
        outer: Node<'_>,
        owner: Option<&str>,
        name_node: Option<Node<'_>>,
    ) {
        let Some(name_node) = name_node.or_else(|| def.child_by_field_name("name")) else {
            return;
        };
        let ident = self.text(name_node);
        let params = def
            .child_by_field_name("parameters")
            .or_else(|| def.child_by_field_name("parameter"))
            .map(|p| self.text(p))
            .unwrap_or_default();
        let header_end = def
            .child_by_field_name("body")
            .map_or(def.end_byte(), |b| b.start_byte());
        let header = slice(self.source, outer.start_byte(), header_end);
        let signature = collapse_whitespace(header)
            .trim_end_matches(['{', ':'])
            .trim_end()
            .to_owned();

        let (name, kind) = match owner {
            Some(owner) => (
                format!("{owner}{}{ident}", self.language.member_separator()),
                SymbolKind::Method,
            ),
            None => (ident.to_owned(), SymbolKind::Function),
        };

        self.found.push(Found {
            name,
            kind,
            signature,
            params: collapse_whitespace(params),
            span: Span {
                start_byte: outer.start_byte(),
                end_byte: outer.end_byte(),
                start_line: outer.start_position().row + 1,
                end_line: outer.end_position().row + 1,
            },
            name_span: (name_node.start_byte(), name_node.end_byte()),
        });
    }

    fn finish(self) -> Vec<SymbolVersion> {
        let mut seen: std::collections::BTreeMap<String, usize> = std::collections::BTreeMap::new();
        self.found
            .into_iter()
            .map(|f| {
                let count = seen.entry(f.name.clone()).or_insert(0);
                *count += 1;
                let name = if *count == 1 {
                    f.name
                } else {
                    format!("{}#{count}", f.name)
                };
                let body = slice(self.source, f.span.start_byte, f.span.end_byte);
                SymbolVersion {
                    name,
                    kind: f.kind,
                    signature: f.signature,
                    signature_hash: sha256_hex(f.params.as_bytes()),
                    body_hash: sha256_hex(body.as_bytes()),
                    span: f.span,
                    name_span: f.name_span,
                }
            })
            .collect()
    }
}

fn strip_generics(type_text: &str) -> String {
    type_text
        .split(['<', '['])
        .next()
        .unwrap_or(type_text)
        .trim()
        .to_owned()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(path: &str, src: &str) -> ParsedFile {
        extract(path, src.as_bytes(), &Language::ALL).unwrap()
    }

    fn names(file: &ParsedFile) -> Vec<&str> {
        file.symbols.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn detect_language_from_extension() {
        assert_eq!(Language::from_path("src/lib.rs"), Some(Language::Rust));
        assert_eq!(Language::from_path("app/views.py"), Some(Language::Python));
        assert_eq!(Language::from_path("web/App.tsx"), Some(Language::TypeScript));
        assert_eq!(Language::from_path("web/app.mjs"), Some(Language::JavaScript));
        assert_eq!(Language::from_path("cmd/main.go"), Some(Language::Go));
        assert_eq!(Language::from_path("README.md"), None);
        assert_eq!(Language::from_path("Makefile"), None);
    }

    #[test]
    fn python_functions_and_methods() {
        let file = parse(
            "calc.py",
            "import math\n\n\ndef calc(a, b):\n    return a + b\n\n\nclass Shape:\n    sides = 0\n\n    def area(self):\n        return 0\n\n    @property\n    def name(self):\n        return 'shape'\n",
        );
        assert_eq!(names(&file), vec!["calc", "Shape.area", "Shape.name"]);
        let calc = file.get("calc").unwrap();
        assert_eq!(calc.kind, SymbolKind::Function);
        assert_eq!(calc.signature, "def calc(a, b)");
        assert_eq!(file.text(calc), "def calc(a, b):\n    return a + b");
        assert_eq!(file.get("Shape.area").unwrap().kind, SymbolKind::Method);
        assert!(file.text(file.get("Shape.name").unwrap()).starts_with("@property"));
    }

    #[test]
    fn rust_functions_and_impl_methods() {
        let file = parse(
            "src/point.rs",
            "use std::fmt;\n\npub fn origin() -> Point {\n    Point { x: 0 }\n}\n\nimpl<T> Wrapper<T> {\n    fn get(&self) -> &T {\n        &self.0\n    }\n}\n",
        );
        assert_eq!(names(&file), vec!["origin", "Wrapper::get"]);
        assert_eq!(file.get("origin").unwrap().signature, "pub fn origin() -> Point");
    }

    #[test]
    fn typescript_exports_classes_and_arrows() {
        let file = parse(
            "src/util.ts",
            "export function add(a: number, b: number): number {\n  return a + b;\n}\n\nconst twice = (x: number) => x * 2;\n\nclass Counter {\n  inc(by: number) {\n    return by;\n  }\n}\n",
        );
        assert_eq!(names(&file), vec!["add", "twice", "Counter.inc"]);
        assert!(file.text(file.get("add").unwrap()).starts_with("export function add"));
    }

    #[test]
    fn go_functions_and_receiver_methods() {
        let file = parse(
            "main.go",
            "package main\n\nfunc Add(a int, b int) int {\n\treturn a + b\n}\n\nfunc (p *Point) Norm() int {\n\treturn p.x\n}\n",
        );
        assert_eq!(names(&file), vec!["Add", "Point.Norm"]);
    }

    #[test]
    fn whitespace_in_parameters_does_not_change_signature_hash() {
        let a = parse("a.py", "def f(a, b):\n    return 1\n");
        let b = parse("a.py", "def f(a,  b):\n    return 1\n");
        let c = parse("a.py", "def f(a, b, c):\n    return 1\n");
        assert_eq!(a.symbols[0].signature_hash, b.symbols[0].signature_hash);
        assert_ne!(a.symbols[0].body_hash, b.symbols[0].body_hash);
        assert_ne!(a.symbols[0].signature_hash, c.symbols[0].signature_hash);
    }

    #[test]
    fn duplicate_names_get_suffixes() {
        let file = parse("a.py", "def f():\n    return 1\n\ndef f():\n    return 2\n");
        assert_eq!(names(&file), vec!["f", "f#2"]);
    }

    #[test]
    fn syntax_error_is_reported() {
        let err = extract("a.py", b"def f(:\n    return\n", &Language::ALL).unwrap_err();
        assert!(matches!(err, ExtractError::Syntax { .. }));
    }

    #[test]
    fn unsupported_and_disabled_languages() {
        let err = extract("notes.txt", b"hello", &Language::ALL).unwrap_err();
        assert_eq!(
            err,
            ExtractError::UnsupportedLanguage {
                extension: Some("txt".into())
            }
        );
        assert!(extract("a.py", b"x = 1\n", &[Language::Rust]).is_err());
    }

    #[test]
    fn non_utf8_is_rejected() {
        let err = extract("a.py", &[0xff, 0xfe, b'\n'], &Language::ALL).unwrap_err();
        assert_eq!(err, ExtractError::NotUtf8);
    }

    #[test]
    fn layout_ignores_symbol_bodies_and_blank_lines() {
        let a = parse("a.py", "import os\n\ndef f():\n    return 1\n");
        let b = parse("a.py", "import os\n\n\n\ndef f():\n    return 2\n");
        let c = parse("a.py", "import sys\n\ndef f():\n    return 1\n");
        assert_eq!(a.layout(), "import os");
        assert_eq!(a.layout(), b.layout());
        assert_ne!(a.layout(), c.layout());
    }

    #[test]
    fn indent_of_method() {
        let file = parse("a.py", "class A:\n    def m(self):\n        return 1\n");
        assert_eq!(file.indent_of(file.get("A.m").unwrap()), "    ");
    }
}
