use crate::error::ConfigError;
use crate::recipe::{DependencyEdge, HostTargetFields, Namespace, Recipe, RecipeGraph, RecipeKind, RecipeStatus, SourceFields, SourceType};

use std::cell::Cell;

/// Character-level recursive-descent scanner over the whole config buffer.
/// Grammar is whitespace-insensitive except inside `<to EOL>` fields and
/// `block`s, which capture raw text up to a newline or the first unescaped
/// `}` respectively - there is no brace balancing, matching the observed
/// reference behaviour exactly (a shell fragment containing a literal `{`
/// or `}` will truncate early; this is a known, preserved limitation).
struct Scanner<'a> {
    buf: &'a str,
    bytes: &'a [u8],
    index: usize,
}

impl<'a> Scanner<'a> {
    fn new(buf: &'a str) -> Scanner<'a> {
        Scanner { buf, bytes: buf.as_bytes(), index: 0 }
    }

    fn match_str(&mut self, s: &str) -> bool {
        if self.buf[self.index..].starts_with(s) {
            self.index += s.len();
            true
        } else {
            false
        }
    }

    fn match_char(&mut self, c: char) -> bool {
        if self.index < self.bytes.len() && self.bytes[self.index] == c as u8 {
            self.index += 1;
            true
        } else {
            false
        }
    }

    fn expect_char(&mut self, c: char) -> Result<(), ConfigError> {
        if self.match_char(c) {
            Ok(())
        } else if self.at_end() {
            Err(ConfigError::UnexpectedEof { offset: self.index })
        } else {
            Err(ConfigError::UnexpectedSymbol { offset: self.index, expected: c })
        }
    }

    fn ignore_whitespace(&mut self) {
        while self.index < self.bytes.len() && (self.bytes[self.index] as char).is_whitespace() {
            self.index += 1;
        }
    }

    fn at_end(&self) -> bool {
        self.index >= self.bytes.len()
    }

    /// Captures from the current position to the next `\n` (or end of
    /// buffer), trimming trailing whitespace. Matches `parse_to_eol`.
    fn parse_to_eol(&mut self) -> &'a str {
        let start = self.index;
        while self.index < self.bytes.len() && self.bytes[self.index] != b'\n' {
            self.index += 1;
        }
        let end = self.index;
        self.trim_trailing(start, end)
    }

    /// Captures a `{ ... }` block's contents verbatim up to the first `}`,
    /// trimming surrounding whitespace. Matches `parse_block` - note this is
    /// a literal scan, not a balanced-brace parse.
    fn parse_block(&mut self) -> &'a str {
        self.match_char('{');
        self.ignore_whitespace();
        let start = self.index;
        while self.index < self.bytes.len() && self.bytes[self.index] != b'}' {
            self.index += 1;
        }
        let end = self.index;
        self.match_char('}');
        self.trim_trailing(start, end)
    }

    fn trim_trailing(&self, start: usize, end: usize) -> &'a str {
        let mut end = end;
        while end > start && (self.bytes[end - 1] as char).is_whitespace() {
            end -= 1;
        }
        &self.buf[start..end]
    }

    fn parse_identifier(&mut self) -> Result<&'a str, ConfigError> {
        let start = self.index;
        let first = self.bytes.get(self.index).copied().map(|b| b as char);
        if !matches!(first, Some(c) if c.is_ascii_alphabetic() || c == '_') {
            return Err(ConfigError::InvalidIdentifier { offset: self.index });
        }
        while self.index < self.bytes.len() {
            let c = self.bytes[self.index] as char;
            if c.is_ascii_alphanumeric() || c == '_' {
                self.index += 1;
            } else {
                break;
            }
        }
        Ok(&self.buf[start..self.index])
    }

    fn parse_namespace(&mut self) -> Result<Namespace, ConfigError> {
        if self.match_str("source") {
            Ok(Namespace::Source)
        } else if self.match_str("host") {
            Ok(Namespace::Host)
        } else if self.match_str("target") {
            Ok(Namespace::Target)
        } else {
            Err(ConfigError::UnknownNamespace { offset: self.index })
        }
    }

    fn parse_dependencies(&mut self) -> Result<Vec<UnresolvedDependency<'a>>, ConfigError> {
        let mut deps = Vec::new();
        self.expect_char('[')?;
        while !self.match_char(']') {
            self.ignore_whitespace();
            let runtime = self.match_char('*');
            let namespace = self.parse_namespace()?;
            self.expect_char('/')?;
            let name = self.parse_identifier()?;
            deps.push(UnresolvedDependency { namespace, name, runtime });
            self.ignore_whitespace();
        }
        Ok(deps)
    }
}

struct UnresolvedDependency<'a> {
    namespace: Namespace,
    name: &'a str,
    runtime: bool,
}

/// A recipe as read off the page, before dependency/source names have been
/// bound to `RecipeId`s.
pub struct UnresolvedRecipe<'a> {
    pub namespace: Namespace,
    pub name: &'a str,
    pub dependencies: Vec<UnresolvedDependency<'a>>,
    pub body: UnresolvedBody<'a>,
}

pub enum UnresolvedBody<'a> {
    Source {
        url: String,
        source_type: SourceType,
        patch: Option<String>,
        b2sum: Option<String>,
        strap: Option<String>,
    },
    HostTarget {
        source_name: Option<&'a str>,
        configure: Option<String>,
        build: Option<String>,
        install: Option<String>,
    },
}

fn parse_recipe<'a>(scanner: &mut Scanner<'a>) -> Result<UnresolvedRecipe<'a>, ConfigError> {
    let namespace = scanner.parse_namespace()?;
    scanner.expect_char('/')?;
    let name = scanner.parse_identifier()?;

    scanner.ignore_whitespace();
    scanner.expect_char('{')?;

    let mut dependencies = Vec::new();

    let body = match namespace {
        Namespace::Source => {
            let mut url = None;
            let mut source_type = None;
            let mut patch = None;
            let mut b2sum = None;
            let mut strap = None;

            loop {
                scanner.ignore_whitespace();
                if scanner.match_str("url") {
                    scanner.ignore_whitespace();
                    scanner.expect_char(':')?;
                    scanner.ignore_whitespace();
                    url = Some(scanner.parse_to_eol().to_string());
                } else if scanner.match_str("type") {
                    scanner.ignore_whitespace();
                    scanner.expect_char(':')?;
                    scanner.ignore_whitespace();
                    source_type = Some(if scanner.match_str("tar.gz") {
                        SourceType::TarGz
                    } else if scanner.match_str("tar.xz") {
                        SourceType::TarXz
                    } else if scanner.match_str("local") {
                        SourceType::Local
                    } else {
                        return Err(ConfigError::UnknownSourceType { offset: scanner.index });
                    });
                } else if scanner.match_str("patch") {
                    scanner.ignore_whitespace();
                    scanner.expect_char(':')?;
                    scanner.ignore_whitespace();
                    patch = Some(scanner.parse_to_eol().to_string());
                } else if scanner.match_str("b2sum") {
                    scanner.ignore_whitespace();
                    scanner.expect_char(':')?;
                    scanner.ignore_whitespace();
                    b2sum = Some(scanner.parse_to_eol().to_string());
                } else if scanner.match_str("dependencies") {
                    scanner.ignore_whitespace();
                    dependencies = scanner.parse_dependencies()?;
                } else if scanner.match_str("strap") {
                    scanner.ignore_whitespace();
                    strap = Some(scanner.parse_block().to_string());
                } else {
                    scanner.expect_char('}')?;
                    break;
                }
            }

            let url = url.ok_or_else(|| missing_field(namespace, name, "url"))?;
            let source_type = source_type.ok_or_else(|| missing_field(namespace, name, "type"))?;
            if b2sum.is_none() && matches!(source_type, SourceType::TarGz | SourceType::TarXz) {
                return Err(missing_field(namespace, name, "b2sum"));
            }

            UnresolvedBody::Source { url, source_type, patch, b2sum, strap }
        }
        Namespace::Host | Namespace::Target => {
            let mut source_name = None;
            let mut configure = None;
            let mut build = None;
            let mut install = None;

            loop {
                scanner.ignore_whitespace();
                if scanner.match_str("source") {
                    scanner.ignore_whitespace();
                    scanner.expect_char(':')?;
                    scanner.ignore_whitespace();
                    source_name = Some(scanner.parse_identifier()?);
                } else if scanner.match_str("configure") {
                    scanner.ignore_whitespace();
                    configure = Some(scanner.parse_block().to_string());
                } else if scanner.match_str("build") {
                    scanner.ignore_whitespace();
                    build = Some(scanner.parse_block().to_string());
                } else if scanner.match_str("install") {
                    scanner.ignore_whitespace();
                    install = Some(scanner.parse_block().to_string());
                } else if scanner.match_str("dependencies") {
                    scanner.ignore_whitespace();
                    dependencies = scanner.parse_dependencies()?;
                } else {
                    scanner.expect_char('}')?;
                    break;
                }
            }

            UnresolvedBody::HostTarget { source_name, configure, build, install }
        }
    };

    Ok(UnresolvedRecipe { namespace, name, dependencies, body })
}

fn missing_field(namespace: Namespace, name: &str, field: &'static str) -> ConfigError {
    ConfigError::MissingField { namespace: namespace.to_string(), name: name.to_string(), field }
}

/// Scans the whole buffer: a top-level loop of `//`-comments and recipe
/// declarations, each separated by arbitrary whitespace. Matches
/// `config_read`'s outer loop.
pub fn parse_recipes(buf: &str) -> Result<Vec<UnresolvedRecipe<'_>>, ConfigError> {
    let mut scanner = Scanner::new(buf);
    let mut recipes = Vec::new();

    loop {
        scanner.ignore_whitespace();
        if scanner.at_end() {
            break;
        }
        if scanner.match_str("//") {
            scanner.parse_to_eol();
            continue;
        }
        recipes.push(parse_recipe(&mut scanner)?);
    }

    Ok(recipes)
}

/// Binds every dependency and `source:` name against the full recipe set,
/// producing a `RecipeGraph` with resolved `RecipeId` edges. Matches
/// `config_read`'s second pass over `find_recipe`.
pub fn resolve(unresolved: Vec<UnresolvedRecipe<'_>>) -> Result<RecipeGraph, ConfigError> {
    let mut graph = RecipeGraph::new();
    let mut seen: std::collections::HashSet<(Namespace, &str)> = std::collections::HashSet::new();

    for recipe in &unresolved {
        if !seen.insert((recipe.namespace, recipe.name)) {
            return Err(ConfigError::DuplicateRecipe { namespace: recipe.namespace.to_string(), name: recipe.name.to_string() });
        }
    }

    for recipe in &unresolved {
        let kind = match &recipe.body {
            UnresolvedBody::Source { url, source_type, patch, b2sum, strap } => RecipeKind::Source(SourceFields {
                url: url.clone(),
                source_type: *source_type,
                patch: patch.clone(),
                b2sum: b2sum.clone(),
                strap: strap.clone(),
            }),
            UnresolvedBody::HostTarget { configure, build, install, .. } => RecipeKind::HostTarget(HostTargetFields {
                source: None,
                configure: configure.clone(),
                build: build.clone(),
                install: install.clone(),
            }),
        };

        graph.push(Recipe {
            namespace: recipe.namespace,
            name: recipe.name.to_string(),
            dependencies: Vec::new(),
            kind,
            status: Cell::new(RecipeStatus::default()),
        });
    }

    for (id, recipe) in unresolved.iter().enumerate() {
        let id = crate::recipe::RecipeId(id as u32);

        let mut edges = Vec::with_capacity(recipe.dependencies.len());
        for dep in &recipe.dependencies {
            let target = graph.find(dep.namespace, dep.name).ok_or_else(|| ConfigError::UnresolvedDependency {
                from_namespace: recipe.namespace.to_string(),
                from_name: recipe.name.to_string(),
                to_namespace: dep.namespace.to_string(),
                to_name: dep.name.to_string(),
            })?;
            edges.push(DependencyEdge { target, runtime: dep.runtime });
        }

        if let UnresolvedBody::HostTarget { source_name: Some(source_name), .. } = &recipe.body {
            let source_id = graph.find(Namespace::Source, source_name).ok_or_else(|| ConfigError::UnresolvedSource {
                namespace: recipe.namespace.to_string(),
                name: recipe.name.to_string(),
                source_name: source_name.to_string(),
            })?;

            graph.set_source(id, source_id);
        }

        graph.set_dependencies(id, edges);
    }

    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_source_recipe() {
        let recipes = parse_recipes("source/zlib {\n    url: https://example.com/zlib.tar.gz\n    type: tar.gz\n    b2sum: abcdef\n}\n").unwrap();
        assert_eq!(recipes.len(), 1);
        assert_eq!(recipes[0].namespace, Namespace::Source);
        assert_eq!(recipes[0].name, "zlib");
    }

    #[test]
    fn requires_b2sum_for_tar_sources() {
        let err = parse_recipes("source/zlib {\n    url: https://example.com/zlib.tar.gz\n    type: tar.gz\n}\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { field: "b2sum", .. }));
    }

    #[test]
    fn local_sources_do_not_require_b2sum() {
        let recipes = parse_recipes("source/local {\n    url: ./vendor\n    type: local\n}\n").unwrap();
        assert_eq!(recipes.len(), 1);
    }

    #[test]
    fn skips_line_comments() {
        let recipes = parse_recipes("// a comment\nsource/zlib {\n    url: x\n    type: local\n}\n").unwrap();
        assert_eq!(recipes.len(), 1);
    }

    #[test]
    fn parses_dependency_list_with_runtime_marker() {
        let recipes = parse_recipes(
            "source/zlib {\n url: x\n type: local\n}\nhost/gcc {\n source: zlib\n dependencies: [ *source/zlib ]\n build: { make }\n}\n",
        )
        .unwrap();
        let gcc = &recipes[1];
        assert_eq!(gcc.dependencies.len(), 1);
        assert!(gcc.dependencies[0].runtime);
    }

    #[test]
    fn block_stops_at_first_closing_brace() {
        let recipes = parse_recipes("host/x {\n build: { echo \"a}b\" }\n}\n").unwrap();
        if let UnresolvedBody::HostTarget { build: Some(build), .. } = &recipes[0].body {
            assert_eq!(build, "echo \"a");
        } else {
            panic!("expected host/target body");
        }
    }

    #[test]
    fn resolve_binds_dependency_ids() {
        let recipes = parse_recipes(
            "source/zlib {\n url: x\n type: local\n}\nhost/gcc {\n source: zlib\n dependencies: [ source/zlib ]\n build: { make }\n}\n",
        )
        .unwrap();
        let graph = resolve(recipes).unwrap();
        let gcc = graph.find(Namespace::Host, "gcc").unwrap();
        let recipe = graph.get(gcc);
        assert_eq!(recipe.dependencies.len(), 1);
        if let RecipeKind::HostTarget(fields) = &recipe.kind {
            assert!(fields.source.is_some());
        } else {
            panic!("expected host/target kind");
        }
    }

    #[test]
    fn resolve_errors_on_unknown_dependency() {
        let recipes = parse_recipes("host/gcc {\n dependencies: [ source/missing ]\n}\n").unwrap();
        let err = resolve(recipes).unwrap_err();
        assert!(matches!(err, ConfigError::UnresolvedDependency { .. }));
    }

    #[test]
    fn resolve_errors_on_duplicate_recipe() {
        let recipes = parse_recipes("source/zlib {\n url: x\n type: local\n}\nsource/zlib {\n url: y\n type: local\n}\n").unwrap();
        let err = resolve(recipes).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateRecipe { .. }));
    }

    #[test]
    fn truncated_recipe_reports_unexpected_eof() {
        let err = parse_recipes("source/zlib {\n url: x\n type: local").unwrap_err();
        assert!(matches!(err, ConfigError::UnexpectedEof { .. }));
    }
}
