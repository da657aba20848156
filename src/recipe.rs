use std::cell::Cell;
use std::fmt;

/// The three recipe namespaces. `Source` recipes describe how to fetch and
/// unpack upstream sources; `Host` and `Target` recipes describe how to
/// configure/build/install something against the build machine or the
/// cross-compilation target, respectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Namespace {
    Source,
    Host,
    Target,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Source => "source",
            Namespace::Host => "host",
            Namespace::Target => "target",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a `source` recipe's archive is distributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    TarGz,
    TarXz,
    Local,
}

/// An index into a `RecipeGraph`'s arena. Kept as a plain `u32` rather than a
/// pointer or `Rc<RefCell<_>>` so the graph has no interior reference cycles -
/// dependency edges and `source:` references are just `RecipeId`s resolved
/// after parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecipeId(pub u32);

/// A dependency edge. `runtime` marks edges introduced with a leading `*` in
/// the config grammar - these are the only edges re-staged transitively past
/// the build engine's root recipe.
#[derive(Debug, Clone, Copy)]
pub struct DependencyEdge {
    pub target: RecipeId,
    pub runtime: bool,
}

#[derive(Debug, Clone)]
pub struct SourceFields {
    pub url: String,
    pub source_type: SourceType,
    pub patch: Option<String>,
    pub b2sum: Option<String>,
    pub strap: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HostTargetFields {
    pub source: Option<RecipeId>,
    pub configure: Option<String>,
    pub build: Option<String>,
    pub install: Option<String>,
}

#[derive(Debug, Clone)]
pub enum RecipeKind {
    Source(SourceFields),
    HostTarget(HostTargetFields),
}

/// Whether a recipe has been built this run, and whether a prior build is
/// considered stale and must be redone regardless of cache presence.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecipeStatus {
    pub built: bool,
    pub invalidated: bool,
}

#[derive(Debug, Clone)]
pub struct Recipe {
    pub namespace: Namespace,
    pub name: String,
    pub dependencies: Vec<DependencyEdge>,
    pub kind: RecipeKind,
    pub status: Cell<RecipeStatus>,
}

impl Recipe {
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// The full set of recipes parsed from one config file, addressed by
/// `RecipeId`. Dependency and `source:` edges are only valid once the
/// resolution pass has run (see `config::resolve`).
#[derive(Debug, Default)]
pub struct RecipeGraph {
    recipes: Vec<Recipe>,
}

impl RecipeGraph {
    pub fn new() -> RecipeGraph {
        RecipeGraph { recipes: Vec::new() }
    }

    pub fn push(&mut self, recipe: Recipe) -> RecipeId {
        let id = RecipeId(self.recipes.len() as u32);
        self.recipes.push(recipe);
        id
    }

    pub fn get(&self, id: RecipeId) -> &Recipe {
        &self.recipes[id.0 as usize]
    }

    /// Binds the resolved dependency edges for a recipe. Used only by the
    /// config resolution pass, after every recipe has been pushed, so
    /// `RecipeId`s referenced in the edges are guaranteed valid.
    pub fn set_dependencies(&mut self, id: RecipeId, edges: Vec<DependencyEdge>) {
        self.recipes[id.0 as usize].dependencies = edges;
    }

    /// Binds a host/target recipe's resolved `source:` reference. Used only
    /// by the config resolution pass.
    pub fn set_source(&mut self, id: RecipeId, source: RecipeId) {
        if let RecipeKind::HostTarget(fields) = &mut self.recipes[id.0 as usize].kind {
            fields.source = Some(source);
        }
    }

    pub fn find(&self, namespace: Namespace, name: &str) -> Option<RecipeId> {
        self.recipes
            .iter()
            .position(|r| r.namespace == namespace && r.name == name)
            .map(|idx| RecipeId(idx as u32))
    }

    pub fn len(&self) -> usize {
        self.recipes.len()
    }
}

/// A dedup-by-identity set of `RecipeId`s, used by the build engine while
/// walking the dependency closure so a diamond dependency is only staged
/// once. Mirrors `recipe_list_t`'s linear find-before-insert behaviour.
#[derive(Debug, Default)]
pub struct RecipeSet {
    ids: Vec<RecipeId>,
}

impl RecipeSet {
    pub fn new() -> RecipeSet {
        RecipeSet { ids: Vec::new() }
    }

    pub fn contains(&self, id: RecipeId) -> bool {
        self.ids.contains(&id)
    }

    pub fn insert(&mut self, id: RecipeId) {
        debug_assert!(!self.contains(id));
        self.ids.push(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(name: &str) -> Recipe {
        Recipe {
            namespace: Namespace::Source,
            name: name.to_string(),
            dependencies: Vec::new(),
            kind: RecipeKind::Source(SourceFields {
                url: "https://example.com/x.tar.gz".to_string(),
                source_type: SourceType::TarGz,
                patch: None,
                b2sum: Some("deadbeef".to_string()),
                strap: None,
            }),
            status: Cell::new(RecipeStatus::default()),
        }
    }

    #[test]
    fn find_locates_by_namespace_and_name() {
        let mut graph = RecipeGraph::new();
        let id = graph.push(source("zlib"));
        assert_eq!(graph.find(Namespace::Source, "zlib"), Some(id));
        assert_eq!(graph.find(Namespace::Host, "zlib"), None);
    }

    #[test]
    fn recipe_set_dedupes() {
        let mut set = RecipeSet::new();
        let id = RecipeId(0);
        assert!(!set.contains(id));
        set.insert(id);
        assert!(set.contains(id));
    }

    #[test]
    fn qualified_name_formats_as_namespace_slash_name() {
        let mut graph = RecipeGraph::new();
        graph.push(source("zlib"));
        assert_eq!(graph.get(RecipeId(0)).qualified_name(), "source/zlib");
    }
}
