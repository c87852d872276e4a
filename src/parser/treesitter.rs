//! Default [`SymbolParser`]: tree-sitter grammars for C# and TypeScript/TSX.
//!
//! Files in any other language parse to an empty symbol list.

use super::SymbolParser;
use crate::Symbol;
use crate::error::{Result, SymbolsError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lang {
    CSharp,
    TypeScript,
    Tsx,
}

impl Lang {
    fn for_path(path: &str) -> Option<Self> {
        let ext = std::path::Path::new(path).extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "cs" => Some(Self::CSharp),
            "ts" | "mts" | "cts" => Some(Self::TypeScript),
            "tsx" => Some(Self::Tsx),
            _ => None,
        }
    }

    fn grammar(self) -> tree_sitter::Language {
        match self {
            Self::CSharp => tree_sitter_c_sharp::LANGUAGE.into(),
            Self::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
            Self::Tsx => tree_sitter_typescript::LANGUAGE_TSX.into(),
        }
    }
}

/// How a syntax node maps to symbols.
#[derive(Debug, Clone, Copy)]
enum Decl {
    /// Named declaration whose body holds members.
    Container(&'static str),
    /// Named declaration without interesting members.
    Leaf(&'static str),
    /// Declaration list (`int a, b;`, `const x = 1, y = 2`): one symbol per declarator.
    Declarators(&'static str),
}

fn classify(lang: Lang, kind: &str) -> Option<Decl> {
    match lang {
        Lang::CSharp => match kind {
            "namespace_declaration" | "file_scoped_namespace_declaration" => Some(Decl::Container("namespace")),
            "class_declaration" => Some(Decl::Container("class")),
            "interface_declaration" => Some(Decl::Container("interface")),
            "struct_declaration" => Some(Decl::Container("struct")),
            "enum_declaration" => Some(Decl::Container("enum")),
            "record_declaration" => Some(Decl::Container("record")),
            "method_declaration" => Some(Decl::Leaf("method")),
            "constructor_declaration" => Some(Decl::Leaf("constructor")),
            "property_declaration" => Some(Decl::Leaf("property")),
            "delegate_declaration" => Some(Decl::Leaf("delegate")),
            "event_declaration" => Some(Decl::Leaf("event")),
            "enum_member_declaration" => Some(Decl::Leaf("enumMember")),
            "field_declaration" => Some(Decl::Declarators("field")),
            "event_field_declaration" => Some(Decl::Declarators("event")),
            _ => None,
        },
        Lang::TypeScript | Lang::Tsx => match kind {
            "internal_module" | "module" => Some(Decl::Container("namespace")),
            "class_declaration" | "abstract_class_declaration" => Some(Decl::Container("class")),
            "interface_declaration" => Some(Decl::Container("interface")),
            "enum_declaration" => Some(Decl::Container("enum")),
            "function_declaration" | "generator_function_declaration" => Some(Decl::Leaf("function")),
            "method_definition" | "method_signature" | "abstract_method_signature" => Some(Decl::Leaf("method")),
            "public_field_definition" => Some(Decl::Leaf("field")),
            "property_signature" => Some(Decl::Leaf("property")),
            "type_alias_declaration" => Some(Decl::Leaf("typeAlias")),
            "lexical_declaration" | "variable_declaration" => Some(Decl::Declarators("variable")),
            _ => None,
        },
    }
}

/// Stateless: a fresh tree-sitter parser is created per file, so one instance
/// can serve every worker thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct TreeSitterParser;

impl TreeSitterParser {
    pub fn new() -> Self {
        Self
    }
}

impl SymbolParser for TreeSitterParser {
    fn parse(&self, path: &str, data: &[u8]) -> Result<Vec<Symbol>> {
        let Some(lang) = Lang::for_path(path) else {
            return Ok(Vec::new());
        };

        let parse_error = |message: String| SymbolsError::Parse { path: path.to_string(), message };

        let mut parser = tree_sitter::Parser::new();
        parser
            .set_language(&lang.grammar())
            .map_err(|e| parse_error(e.to_string()))?;
        let tree = parser
            .parse(data, None)
            .ok_or_else(|| parse_error("tree-sitter returned no tree".to_string()))?;

        let mut symbols = Vec::new();
        walk(tree.root_node(), data, lang, path, "", &mut symbols);
        Ok(symbols)
    }
}

// ─── AST walking ────────────────────────────────────────────────────

fn walk(node: tree_sitter::Node, source: &[u8], lang: Lang, path: &str, parent: &str, out: &mut Vec<Symbol>) {
    match classify(lang, node.kind()) {
        Some(Decl::Container(kind)) => {
            if let Some(name) = declared_name(node, source) {
                out.push(make_symbol(&name, path, node, kind, parent));
                if kind == "enum" && lang != Lang::CSharp {
                    collect_ts_enum_members(node, source, path, &name, out);
                    return;
                }
                for i in 0..node.child_count() {
                    if let Some(child) = node.child(i) {
                        walk(child, source, lang, path, &name, out);
                    }
                }
                return;
            }
        }
        Some(Decl::Leaf(kind)) => {
            if let Some(name) = declared_name(node, source) {
                out.push(make_symbol(&name, path, node, kind, parent));
            }
            return;
        }
        Some(Decl::Declarators(kind)) => {
            collect_declarators(node, source, path, kind, parent, out);
            return;
        }
        None => {}
    }

    for i in 0..node.child_count() {
        if let Some(child) = node.child(i) {
            walk(child, source, lang, path, parent, out);
        }
    }
}

/// C# `field_declaration` nests declarators under a `variable_declaration`;
/// TypeScript puts them directly under the statement.
fn collect_declarators(node: tree_sitter::Node, source: &[u8], path: &str, kind: &str, parent: &str, out: &mut Vec<Symbol>) {
    for i in 0..node.child_count() {
        let Some(child) = node.child(i) else { continue };
        match child.kind() {
            "variable_declarator" => {
                if let Some(name) = declared_name(child, source) {
                    out.push(make_symbol(&name, path, child, kind, parent));
                }
            }
            "variable_declaration" => collect_declarators(child, source, path, kind, parent, out),
            _ => {}
        }
    }
}

fn collect_ts_enum_members(node: tree_sitter::Node, source: &[u8], path: &str, parent: &str, out: &mut Vec<Symbol>) {
    let Some(body) = find_child_by_kind(node, "enum_body") else { return };
    for i in 0..body.child_count() {
        let Some(child) = body.child(i) else { continue };
        let name_node = match child.kind() {
            "property_identifier" => Some(child),
            "enum_assignment" => child.child_by_field_name("name"),
            _ => None,
        };
        if let Some(name_node) = name_node {
            let name = node_text(name_node, source);
            if !name.is_empty() {
                out.push(make_symbol(name, path, child, "enumMember", parent));
            }
        }
    }
}

// ─── Helper utilities ───────────────────────────────────────────────

fn make_symbol(name: &str, path: &str, node: tree_sitter::Node, kind: &str, parent: &str) -> Symbol {
    Symbol {
        name: name.to_string(),
        path: path.to_string(),
        line: node.start_position().row as u32 + 1,
        kind: kind.to_string(),
        parent: parent.to_string(),
    }
}

fn declared_name(node: tree_sitter::Node, source: &[u8]) -> Option<String> {
    let name_node = node.child_by_field_name("name").or_else(|| {
        (0..node.child_count())
            .filter_map(|i| node.child(i))
            .find(|c| matches!(c.kind(), "identifier" | "type_identifier" | "property_identifier"))
    })?;
    let text = node_text(name_node, source);
    if text.is_empty() { None } else { Some(text.to_string()) }
}

fn node_text<'a>(node: tree_sitter::Node, source: &'a [u8]) -> &'a str {
    node.utf8_text(source).unwrap_or("")
}

fn find_child_by_kind<'a>(node: tree_sitter::Node<'a>, kind: &str) -> Option<tree_sitter::Node<'a>> {
    (0..node.child_count())
        .filter_map(|i| node.child(i))
        .find(|c| c.kind() == kind)
}
