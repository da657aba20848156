use std::collections::HashMap;

use crate::error::SubstituteError;

/// Expands every `@(name)` occurrence in `input` using `vars`, left to right,
/// in a single non-recursive pass.
///
/// A bare `@` not followed by `(` is left untouched, as is `@(` with no
/// matching `)` before the string ends - it is copied through literally.
/// `@()` (an empty name) is treated as the literal text `@()`, matching the
/// original implementation's `embed_length == 3` short-circuit. Expansions
/// are not recursive: a substituted value is never itself re-scanned for
/// further `@(...)` forms.
pub fn substitute(input: &str, vars: &HashMap<&str, &str>) -> Result<String, SubstituteError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    loop {
        match rest.find('@') {
            None => {
                out.push_str(rest);
                break;
            }
            Some(at) => {
                out.push_str(&rest[..at]);
                let after_at = &rest[at + 1..];

                if !after_at.starts_with('(') {
                    out.push('@');
                    rest = after_at;
                    continue;
                }

                match after_at[1..].find(')') {
                    None => {
                        out.push_str(&rest[at..]);
                        break;
                    }
                    Some(rel_end) => {
                        let name = &after_at[1..1 + rel_end];
                        if name.is_empty() {
                            out.push_str("@()");
                        } else {
                            match vars.get(name) {
                                Some(value) => out.push_str(value),
                                None => return Err(SubstituteError { name: name.to_string() }),
                            }
                        }
                        rest = &after_at[1 + rel_end + 1..];
                    }
                }
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars<'a>(pairs: &[(&'a str, &'a str)]) -> HashMap<&'a str, &'a str> {
        pairs.iter().cloned().collect()
    }

    #[test]
    fn expands_known_names() {
        let v = vars(&[("prefix", "/usr/local")]);
        assert_eq!(substitute("./configure --prefix=@(prefix)", &v).unwrap(), "./configure --prefix=/usr/local");
    }

    #[test]
    fn leaves_bare_at_sign_untouched() {
        let v = vars(&[]);
        assert_eq!(substitute("user@host", &v).unwrap(), "user@host");
    }

    #[test]
    fn empty_embed_is_literal() {
        let v = vars(&[]);
        assert_eq!(substitute("@()", &v).unwrap(), "@()");
    }

    #[test]
    fn unterminated_embed_is_copied_through() {
        let v = vars(&[]);
        assert_eq!(substitute("cmd @(prefix", &v).unwrap(), "cmd @(prefix");
    }

    #[test]
    fn unknown_name_errors() {
        let v = vars(&[]);
        let err = substitute("@(missing)", &v).unwrap_err();
        assert_eq!(err.name, "missing");
    }

    #[test]
    fn expansion_is_not_recursive() {
        let v = vars(&[("a", "@(b)"), ("b", "unreachable")]);
        assert_eq!(substitute("@(a)", &v).unwrap(), "@(b)");
    }

    #[test]
    fn multiple_embeds_left_to_right() {
        let v = vars(&[("a", "1"), ("b", "2")]);
        assert_eq!(substitute("@(a)-@(b)", &v).unwrap(), "1-2");
    }
}
