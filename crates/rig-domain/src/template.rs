//! `$VAR` / `${VAR}` template grammar used by endpoint attributes and argv
//! entries.
//!
//! Parsing is a single pass producing a list of literal/variable parts.
//! Resolution is a pure function of a variable lookup closure: it is total
//! (never silently drops a `$`) and reports an error naming both the
//! attribute and the missing variable when a referenced name is unknown.

use std::collections::HashMap;

use rig_common::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Var(String),
}

/// A parsed `$VAR`/`${VAR}` template. Literal templates (no `$`) resolve to
/// themselves with zero lookups, satisfying R3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    parts: Vec<Part>,
}

impl Template {
    pub fn parse(input: &str) -> Self {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let chars: Vec<char> = input.chars().collect();
        let mut i = 0;

        while i < chars.len() {
            if chars[i] == '$' && i + 1 < chars.len() {
                if chars[i + 1] == '{' {
                    if let Some(end) = chars[i + 2..].iter().position(|&c| c == '}') {
                        if !literal.is_empty() {
                            parts.push(Part::Literal(std::mem::take(&mut literal)));
                        }
                        let name: String = chars[i + 2..i + 2 + end].iter().collect();
                        parts.push(Part::Var(name));
                        i += 2 + end + 1;
                        continue;
                    }
                } else if chars[i + 1].is_ascii_alphabetic() || chars[i + 1] == '_' {
                    let start = i + 1;
                    let mut end = start;
                    while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_') {
                        end += 1;
                    }
                    if !literal.is_empty() {
                        parts.push(Part::Literal(std::mem::take(&mut literal)));
                    }
                    let name: String = chars[start..end].iter().collect();
                    parts.push(Part::Var(name));
                    i = end;
                    continue;
                }
            }
            literal.push(chars[i]);
            i += 1;
        }
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }
        Self { parts }
    }

    /// True if this template contains no `$` references (R3 fast path).
    pub fn is_literal(&self) -> bool {
        !self.parts.iter().any(|p| matches!(p, Part::Var(_)))
    }

    /// Resolves every variable reference against `vars`, failing loudly
    /// (naming `attr_name` and the missing variable) on the first miss.
    pub fn resolve(&self, attr_name: &str, vars: &HashMap<String, String>) -> Result<String> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(s) => out.push_str(s),
                Part::Var(name) => {
                    let value = vars.get(name).ok_or_else(|| {
                        Error::Template(format!(
                            "attribute {attr_name:?} references unknown variable ${{{name}}}"
                        ))
                    })?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

/// Builds the `HOST`/`PORT`/`HOSTPORT` variable set for one endpoint.
pub fn endpoint_vars(host: &str, port: u16) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    vars.insert("HOST".to_string(), host.to_string());
    vars.insert("PORT".to_string(), port.to_string());
    vars.insert("HOSTPORT".to_string(), format!("{host}:{port}"));
    vars
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_template_has_no_vars() {
        let t = Template::parse("static-value");
        assert!(t.is_literal());
        assert_eq!(t.resolve("x", &HashMap::new()).unwrap(), "static-value");
    }

    #[test]
    fn resolves_braced_and_bare_forms() {
        let vars = endpoint_vars("127.0.0.1", 5432);
        assert_eq!(
            Template::parse("postgres://${HOST}:$PORT/db")
                .resolve("url", &vars)
                .unwrap(),
            "postgres://127.0.0.1:5432/db"
        );
        assert_eq!(
            Template::parse("${HOSTPORT}").resolve("addr", &vars).unwrap(),
            "127.0.0.1:5432"
        );
    }

    #[test]
    fn unknown_variable_is_a_hard_error() {
        let err = Template::parse("${NOPE}")
            .resolve("attr", &HashMap::new())
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("attr"));
        assert!(msg.contains("NOPE"));
    }

    #[test]
    fn round_trip_no_dollar_is_unchanged() {
        let vars = endpoint_vars("h", 1);
        for literal in ["", "plain", "a/b:c", "no $ at all but weird chars !@#"] {
            assert_eq!(Template::parse(literal).resolve("a", &vars).unwrap(), literal);
        }
    }
}
