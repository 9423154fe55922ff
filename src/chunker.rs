//! AST-aware chunking: split a source buffer into semantic units (functions,
//! classes, methods, …) with a line-windowed fallback for unsupported
//! languages or unparseable input.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tree_sitter::{Language, Node, Parser};

use crate::cache::TtlLruCache;
use crate::pathutil::{chunk_id, strip_bom};

/// Target size (characters) before a chunk is split into overlapping parts.
const TARGET_CHUNK_CHARS: usize = 1500;
/// Overlap fraction applied on both line and character boundaries when splitting.
const SPLIT_OVERLAP_FRACTION: f64 = 0.15;
/// Minimum content size for a chunk to survive the floor filter.
const MIN_CHUNK_CHARS: usize = 50;
const MIN_CHUNK_LINES: usize = 2;
/// Display length cap for extracted signatures.
const SIGNATURE_DISPLAY_CAP: usize = 240;

/// A semantic unit of source, ready for embedding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub file_path: String,
    pub language: String,
    pub node_kind: String,
    pub name: Option<String>,
    pub signature: Option<String>,
    pub docstring: Option<String>,
    pub content: String,
    pub start_line: usize,
    pub end_line: usize,
}

struct LanguageSpec {
    name: &'static str,
    extensions: &'static [&'static str],
    grammar: fn() -> Language,
    /// Top-level node kinds that each produce one chunk.
    chunk_kinds: &'static [&'static str],
    /// Node kinds searched (in child order) to find a chunk's name.
    name_kinds: &'static [&'static str],
    /// Node kinds that open a body — the signature is the text before the first one.
    body_kinds: &'static [&'static str],
    /// Python-family: docstring is the leading string literal *inside* the body.
    python_like_docstring: bool,
}

fn language_table() -> &'static [LanguageSpec] {
    &[
        LanguageSpec {
            name: "rust",
            extensions: &["rs"],
            grammar: tree_sitter_rust::language,
            chunk_kinds: &[
                "function_item",
                "struct_item",
                "enum_item",
                "trait_item",
                "impl_item",
            ],
            name_kinds: &["identifier", "type_identifier"],
            body_kinds: &["block", "field_declaration_list", "declaration_list"],
            python_like_docstring: false,
        },
        LanguageSpec {
            name: "typescript",
            extensions: &["ts", "tsx", "mts", "cts", "js", "jsx", "mjs", "cjs"],
            grammar: ts_grammar,
            chunk_kinds: &[
                "function_declaration",
                "class_declaration",
                "interface_declaration",
                "type_alias_declaration",
                "lexical_declaration",
                "export_statement",
            ],
            name_kinds: &["identifier", "type_identifier", "property_identifier"],
            body_kinds: &["statement_block", "class_body", "object_type"],
            python_like_docstring: false,
        },
        LanguageSpec {
            name: "python",
            extensions: &["py"],
            grammar: tree_sitter_python::language,
            chunk_kinds: &["function_definition", "class_definition"],
            name_kinds: &["identifier"],
            body_kinds: &["block"],
            python_like_docstring: true,
        },
        #[cfg(feature = "lang-go")]
        LanguageSpec {
            name: "go",
            extensions: &["go"],
            grammar: tree_sitter_go::language,
            chunk_kinds: &["function_declaration", "method_declaration", "type_declaration"],
            name_kinds: &["identifier", "field_identifier", "type_identifier"],
            body_kinds: &["block"],
            python_like_docstring: false,
        },
        #[cfg(feature = "lang-dart")]
        LanguageSpec {
            name: "dart",
            extensions: &["dart"],
            grammar: tree_sitter_dart::language,
            chunk_kinds: &[
                "class_definition",
                "mixin_declaration",
                "extension_declaration",
                "enum_declaration",
                "function_signature",
            ],
            name_kinds: &["identifier"],
            body_kinds: &["function_body", "class_body"],
            python_like_docstring: false,
        },
        #[cfg(feature = "lang-java")]
        LanguageSpec {
            name: "java",
            extensions: &["java"],
            grammar: tree_sitter_java::language,
            chunk_kinds: &["class_declaration", "interface_declaration", "enum_declaration"],
            name_kinds: &["identifier"],
            body_kinds: &["class_body", "interface_body", "enum_body"],
            python_like_docstring: false,
        },
        #[cfg(feature = "lang-csharp")]
        LanguageSpec {
            name: "csharp",
            extensions: &["cs"],
            grammar: tree_sitter_c_sharp::language,
            chunk_kinds: &[
                "class_declaration",
                "struct_declaration",
                "interface_declaration",
                "enum_declaration",
            ],
            name_kinds: &["identifier"],
            body_kinds: &["declaration_list"],
            python_like_docstring: false,
        },
        #[cfg(feature = "lang-php")]
        LanguageSpec {
            name: "php",
            extensions: &["php"],
            grammar: php_grammar,
            chunk_kinds: &[
                "class_declaration",
                "interface_declaration",
                "trait_declaration",
                "function_definition",
            ],
            name_kinds: &["name"],
            body_kinds: &["compound_statement", "declaration_list"],
            python_like_docstring: false,
        },
        #[cfg(feature = "lang-proto")]
        LanguageSpec {
            name: "protobuf",
            extensions: &["proto"],
            grammar: proto_grammar,
            chunk_kinds: &["service", "message", "enum"],
            name_kinds: &["service_name", "message_name", "enum_name", "identifier"],
            body_kinds: &["service_body", "message_body", "enum_body"],
            python_like_docstring: false,
        },
    ]
}

#[cfg(feature = "lang-php")]
fn php_grammar() -> Language {
    tree_sitter_php::LANGUAGE_PHP.into()
}

#[cfg(feature = "lang-proto")]
fn proto_grammar() -> Language {
    tree_sitter_proto::LANGUAGE.into()
}

fn ts_grammar() -> Language {
    tree_sitter_typescript::language_typescript()
}

fn tsx_grammar() -> Language {
    tree_sitter_typescript::language_tsx()
}

fn extension_of(file_path: &str) -> String {
    file_path
        .rsplit('.')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn spec_for_path(file_path: &str) -> Option<&'static LanguageSpec> {
    let ext = extension_of(file_path);
    language_table().iter().find(|s| s.extensions.contains(&ext.as_str()))
}

/// Bounded cache of loaded grammars, guarded by a single mutex — grammar load is
/// infrequent (once per language per process) so a read-biased lock would be
/// premature complexity.
pub struct GrammarCache {
    inner: Mutex<TtlLruCache<&'static str, Language>>,
}

impl GrammarCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(TtlLruCache::new(capacity, None)),
        }
    }

    fn load(&self, spec: &LanguageSpec, file_path: &str) -> Language {
        let mut guard = self.inner.lock().expect("grammar cache poisoned");
        if let Some(lang) = guard.get(&spec.name) {
            return lang.clone();
        }
        let lang = if spec.name == "typescript" {
            let ext = extension_of(file_path);
            if ext == "tsx" || ext == "jsx" {
                tsx_grammar()
            } else {
                (spec.grammar)()
            }
        } else {
            (spec.grammar)()
        };
        guard.put(spec.name, lang.clone());
        lang
    }
}

impl Default for GrammarCache {
    fn default() -> Self {
        // One slot per always-on/feature-gated language; see `language_table`.
        Self::new(language_table().len().max(1))
    }
}

fn node_text<'a>(source: &'a str, node: Node) -> &'a str {
    &source[node.start_byte().min(source.len())..node.end_byte().min(source.len())]
}

fn find_name<'a>(node: Node<'a>, source: &str, spec: &LanguageSpec) -> Option<String> {
    if let Some(named) = node.child_by_field_name("name") {
        let text = node_text(source, named).trim();
        if !text.is_empty() {
            return Some(text.to_string());
        }
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if spec.name_kinds.contains(&child.kind()) {
            let text = node_text(source, child).trim();
            if !text.is_empty() {
                return Some(text.to_string());
            }
        }
    }
    None
}

fn extract_signature(node: Node, source: &str, spec: &LanguageSpec) -> String {
    let full = node_text(source, node);
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if spec.body_kinds.contains(&child.kind()) {
            let prefix_end = child.start_byte().saturating_sub(node.start_byte());
            let sig = full[..prefix_end.min(full.len())].trim_end();
            return truncate_display(sig, SIGNATURE_DISPLAY_CAP);
        }
    }
    truncate_display(full.lines().next().unwrap_or(full), SIGNATURE_DISPLAY_CAP)
}

fn truncate_display(text: &str, cap: usize) -> String {
    if text.len() <= cap {
        return text.to_string();
    }
    let mut end = cap;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

/// Extract a leading docstring: for Python-family languages, a string literal
/// leading the function/class body; otherwise a contiguous run of leading
/// line/block comments immediately preceding the node.
fn extract_docstring(node: Node, source: &str, spec: &LanguageSpec) -> Option<String> {
    if spec.python_like_docstring {
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            if child.kind() == "block" {
                let mut body_cursor = child.walk();
                for stmt in child.children(&mut body_cursor) {
                    if stmt.kind() == "expression_statement" {
                        let mut inner_cursor = stmt.walk();
                        for inner in stmt.children(&mut inner_cursor) {
                            if inner.kind() == "string" {
                                let text = node_text(source, inner).trim();
                                if !text.is_empty() {
                                    return Some(text.to_string());
                                }
                            }
                        }
                    }
                    break;
                }
                break;
            }
        }
        return None;
    }

    let mut comments: Vec<String> = Vec::new();
    let mut sibling = node.prev_sibling();
    while let Some(s) = sibling {
        let kind = s.kind();
        if kind == "line_comment" || kind == "comment" || kind == "block_comment" {
            comments.push(node_text(source, s).trim().to_string());
            sibling = s.prev_sibling();
        } else if s.is_extra() {
            sibling = s.prev_sibling();
        } else {
            break;
        }
    }
    if comments.is_empty() {
        None
    } else {
        comments.reverse();
        Some(comments.join("\n"))
    }
}

/// Parse `(source_bytes, file_path)` into an ordered list of chunks.
///
/// Pure: the same input always produces the same output (no I/O beyond
/// grammar loading through `grammar_cache`).
pub fn chunk(source: &[u8], file_path: &str, grammar_cache: &GrammarCache) -> Vec<Chunk> {
    let text = String::from_utf8_lossy(source);
    let text = strip_bom(&text).to_string();
    if text.trim().is_empty() {
        return Vec::new();
    }

    let Some(spec) = spec_for_path(file_path) else {
        return fallback_chunks(&text, file_path, "unknown");
    };

    let language = grammar_cache.load(spec, file_path);
    let mut parser = Parser::new();
    if parser.set_language(&language).is_err() {
        return fallback_chunks(&text, file_path, spec.name);
    }
    let Some(tree) = parser.parse(text.as_bytes(), None) else {
        return fallback_chunks(&text, file_path, spec.name);
    };
    let root = tree.root_node();

    let mut raw: Vec<Chunk> = Vec::new();
    let mut cursor = root.walk();
    for node in root.children(&mut cursor) {
        let mut target = node;
        // TypeScript/JS wrap declarations in `export_statement`; chunk the inner
        // declaration's kind but keep the export's full span so the `export`
        // keyword is preserved in the emitted content.
        if target.kind() == "export_statement" {
            if let Some(inner) = target.child_by_field_name("declaration") {
                if !spec.chunk_kinds.contains(&inner.kind()) {
                    continue;
                }
                target = node; // keep outer span, use inner for name/signature extraction below
                let name = find_name(inner, &text, spec);
                push_chunk(&mut raw, &text, file_path, spec, node, name);
                continue;
            } else {
                continue;
            }
        }
        if !spec.chunk_kinds.contains(&target.kind()) {
            continue;
        }
        let name = find_name(target, &text, spec);
        push_chunk(&mut raw, &text, file_path, spec, target, name);
    }

    if raw.is_empty() {
        return fallback_chunks(&text, file_path, spec.name);
    }

    let mut out = Vec::new();
    for c in raw {
        out.extend(split_if_oversized(c));
    }
    out.retain(|c| passes_floor(c));
    out
}

fn push_chunk(
    out: &mut Vec<Chunk>,
    text: &str,
    file_path: &str,
    spec: &LanguageSpec,
    node: Node,
    name: Option<String>,
) {
    let content = node_text(text, node).to_string();
    if content.trim().is_empty() {
        return;
    }
    let start_line = node.start_position().row + 1;
    let end_line = node.end_position().row + 1;
    let signature = Some(extract_signature(node, text, spec));
    let docstring = extract_docstring(node, text, spec);
    out.push(Chunk {
        id: chunk_id(file_path, start_line, None),
        file_path: file_path.to_string(),
        language: spec.name.to_string(),
        node_kind: node.kind().to_string(),
        name,
        signature,
        docstring,
        content,
        start_line,
        end_line,
    });
}

fn passes_floor(c: &Chunk) -> bool {
    c.content.len() >= MIN_CHUNK_CHARS && (c.end_line.saturating_sub(c.start_line) + 1) >= MIN_CHUNK_LINES
}

/// Split an oversized chunk into overlapping parts on line and character boundaries.
fn split_if_oversized(c: Chunk) -> Vec<Chunk> {
    if c.content.len() <= TARGET_CHUNK_CHARS {
        return vec![c];
    }

    let lines: Vec<&str> = c.content.lines().collect();
    if lines.len() <= 1 {
        return split_by_chars(c);
    }

    let total_lines = lines.len();
    // Approximate the number of source lines a TARGET_CHUNK_CHARS window covers.
    let avg_line_len = (c.content.len() / total_lines).max(1);
    let window_lines = (TARGET_CHUNK_CHARS / avg_line_len).max(1);
    let overlap_lines = ((window_lines as f64) * SPLIT_OVERLAP_FRACTION).round() as usize;
    let step = window_lines.saturating_sub(overlap_lines).max(1);

    let mut parts = Vec::new();
    let mut start = 0usize;
    let mut part_index = 0usize;
    while start < total_lines {
        let end = (start + window_lines).min(total_lines);
        let part_text = lines[start..end].join("\n");
        if !part_text.trim().is_empty() {
            parts.push(Chunk {
                id: chunk_id(&c.file_path, c.start_line + start, Some(part_index)),
                file_path: c.file_path.clone(),
                language: c.language.clone(),
                node_kind: c.node_kind.clone(),
                name: c.name.clone().map(|n| format!("{n}_part{part_index}")),
                signature: c.signature.clone(),
                docstring: if part_index == 0 { c.docstring.clone() } else { None },
                content: part_text,
                start_line: c.start_line + start,
                end_line: (c.start_line + end).saturating_sub(1),
            });
            part_index += 1;
        }
        if end >= total_lines {
            break;
        }
        start += step;
    }
    if parts.is_empty() {
        vec![c]
    } else {
        parts
    }
}

fn split_by_chars(c: Chunk) -> Vec<Chunk> {
    let bytes = c.content.as_bytes();
    let overlap = ((TARGET_CHUNK_CHARS as f64) * SPLIT_OVERLAP_FRACTION).round() as usize;
    let step = TARGET_CHUNK_CHARS.saturating_sub(overlap).max(1);
    let mut parts = Vec::new();
    let mut start = 0usize;
    let mut part_index = 0usize;
    while start < bytes.len() {
        let mut end = (start + TARGET_CHUNK_CHARS).min(bytes.len());
        while end < bytes.len() && !c.content.is_char_boundary(end) {
            end += 1;
        }
        let text = c.content[start..end].to_string();
        if !text.trim().is_empty() {
            parts.push(Chunk {
                id: chunk_id(&c.file_path, c.start_line, Some(part_index)),
                file_path: c.file_path.clone(),
                language: c.language.clone(),
                node_kind: c.node_kind.clone(),
                name: c.name.clone().map(|n| format!("{n}_part{part_index}")),
                signature: c.signature.clone(),
                docstring: if part_index == 0 { c.docstring.clone() } else { None },
                content: text,
                start_line: c.start_line,
                end_line: c.end_line,
            });
            part_index += 1;
        }
        if end >= bytes.len() {
            break;
        }
        start += step;
    }
    if parts.is_empty() {
        vec![c]
    } else {
        parts
    }
}

/// Line-windowed fallback for unsupported languages or failed parses.
fn fallback_chunks(text: &str, file_path: &str, language: &str) -> Vec<Chunk> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        return Vec::new();
    }
    let avg_line_len = (text.len() / lines.len()).max(1);
    let window_lines = (TARGET_CHUNK_CHARS / avg_line_len).max(1);
    let overlap_lines = ((window_lines as f64) * SPLIT_OVERLAP_FRACTION).round() as usize;
    let step = window_lines.saturating_sub(overlap_lines).max(1);

    let mut out = Vec::new();
    let mut start = 0usize;
    while start < lines.len() {
        let end = (start + window_lines).min(lines.len());
        let content = lines[start..end].join("\n");
        if content.len() >= MIN_CHUNK_CHARS && (end - start) >= MIN_CHUNK_LINES {
            out.push(Chunk {
                id: chunk_id(file_path, start + 1, None),
                file_path: file_path.to_string(),
                language: language.to_string(),
                node_kind: "fallback_chunk".to_string(),
                name: None,
                signature: None,
                docstring: None,
                content,
                start_line: start + 1,
                end_line: end,
            });
        }
        if end >= lines.len() {
            break;
        }
        start += step;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> GrammarCache {
        GrammarCache::default()
    }

    #[test]
    fn empty_source_returns_no_chunks() {
        assert!(chunk(b"", "empty.rs", &cache()).is_empty());
        assert!(chunk(b"   \n\t\n", "empty.rs", &cache()).is_empty());
    }

    #[test]
    fn rust_function_becomes_one_chunk_with_name() {
        let source =
            b"fn add(a: i32, b: i32) -> i32 {\n    let sum = a + b;\n    sum\n}\n";
        let chunks = chunk(source, "src/math.rs", &cache());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].name.as_deref(), Some("add"));
        assert_eq!(chunks[0].language, "rust");
        assert_eq!(chunks[0].node_kind, "function_item");
    }

    #[test]
    fn unique_ids_within_one_chunk_call() {
        let source = br#"
fn one() { println!("the first function body"); }
fn two() { println!("the second function body"); }
struct Three { field_one: u32, field_two: u32 }
"#;
        let chunks = chunk(source, "src/lib.rs", &cache());
        let mut ids: Vec<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
        let before = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), before);
    }

    #[test]
    fn unsupported_extension_falls_back_to_line_windows() {
        let source = "line one that is reasonably long to pass the floor filter\n".repeat(3);
        let chunks = chunk(source.as_bytes(), "notes.txt", &cache());
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.node_kind == "fallback_chunk"));
    }

    #[test]
    fn oversized_chunk_is_split_with_overlap() {
        let body = "    let x = 1;\n".repeat(200);
        let source = format!("fn big() {{\n{body}}}\n");
        let chunks = chunk(source.as_bytes(), "src/big.rs", &cache());
        assert!(chunks.len() > 1, "expected the oversized function to split");
        assert!(chunks[0].id.ends_with("_p0"));
    }

    #[test]
    fn floor_filter_drops_tiny_chunks() {
        let source = b"fn a(){}\n";
        let chunks = chunk(source, "src/tiny.rs", &cache());
        assert!(chunks.is_empty());
    }

    #[test]
    fn python_docstring_is_extracted() {
        let source = b"def greet(name):\n    \"\"\"Say hello to name.\"\"\"\n    return f'hello {name}'\n";
        let chunks = chunk(source, "greet.py", &cache());
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].docstring.as_deref().unwrap().contains("Say hello"));
    }
}
