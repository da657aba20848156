use std::fs::read_to_string;
use std::path::Path;

use anyhow::{Context, Result};

use crate::recipe::RecipeGraph;

mod parser;

/// Reads and fully resolves a `config.chariot` file into a `RecipeGraph`.
pub fn parse(path: impl AsRef<Path>) -> Result<RecipeGraph> {
    let path = path.as_ref();
    let buf = read_to_string(path).with_context(|| format!("Failed to read config `{}`", path.display()))?;

    let unresolved = parser::parse_recipes(&buf).with_context(|| format!("Failed to parse config `{}`", path.display()))?;
    parser::resolve(unresolved).with_context(|| format!("Failed to resolve config `{}`", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parses_file_from_disk() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "source/zlib {{\n url: ./vendor\n type: local\n}}\n").unwrap();

        let graph = parse(file.path()).unwrap();
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(parse("/nonexistent/config.chariot").is_err());
    }
}
