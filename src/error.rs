use thiserror::Error;

/// Errors raised while scanning and resolving a `config.chariot` file.
///
/// Every variant carries the byte offset into the source buffer where the
/// problem was found, so `main` can print a single-line, offset-annotated
/// diagnostic instead of an opaque `anyhow` chain.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{offset}: Expected `{expected}`")]
    UnexpectedSymbol { offset: usize, expected: char },

    #[error("{offset}: Unexpected end of file")]
    UnexpectedEof { offset: usize },

    #[error("{offset}: Invalid identifier")]
    InvalidIdentifier { offset: usize },

    #[error("{offset}: Unknown namespace")]
    UnknownNamespace { offset: usize },

    #[error("{offset}: Unknown source type")]
    UnknownSourceType { offset: usize },

    #[error("Recipe `{namespace}/{name}` is missing required field `{field}`")]
    MissingField { namespace: String, name: String, field: &'static str },

    #[error("Recipe `{namespace}/{name}` declared more than once")]
    DuplicateRecipe { namespace: String, name: String },

    #[error("Recipe `{from_namespace}/{from_name}` depends on unknown recipe `{to_namespace}/{to_name}`")]
    UnresolvedDependency {
        from_namespace: String,
        from_name: String,
        to_namespace: String,
        to_name: String,
    },

    #[error("Recipe `{namespace}/{name}` references unknown source `{source_name}`")]
    UnresolvedSource { namespace: String, name: String, source_name: String },
}

/// Raised when `@(name)` substitution encounters a name with no bound value.
#[derive(Debug, Error)]
#[error("Unknown embed `{name}`")]
pub struct SubstituteError {
    pub name: String,
}

/// Error kinds the build engine and container layer need to branch on.
/// Everything else is surfaced as a plain `anyhow::Error` with a `.context()`
/// chain instead.
#[derive(Debug, Error)]
pub enum ChariotError {
    #[error("Cache I/O failed for `{namespace}/{name}`: {source}")]
    CacheIo {
        namespace: String,
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to fetch source for `{name}`")]
    FetchFail { name: String },

    #[error("Checksum verification failed for `{name}`")]
    ChecksumFail { name: String },

    #[error("Failed to extract archive for `{name}`")]
    ExtractFail { name: String },

    #[error("Patch `{patch}` referenced by `{name}` was not found in the patches directory")]
    PatchMissing { name: String, patch: String },

    #[error("Applying patch `{patch}` failed for `{name}`")]
    PatchFail { name: String, patch: String },

    #[error("Stage command failed for `{namespace}/{name}`")]
    StageExec { namespace: String, name: String },

    #[error("Unknown embed `{name}` in `{namespace}/{recipe_name}`")]
    UnknownEmbed { namespace: String, recipe_name: String, name: String },

    #[error("Container syscall failed: {0}")]
    ContainerSyscall(#[source] anyhow::Error),
}
