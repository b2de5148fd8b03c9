//! Denylists of identifiers that never appear in a valid expression.
//!
//! Names that reach prototypes, code loading or the host process are rejected
//! anywhere in the block text, string literals included, and computed member
//! keys are checked against them at evaluation time. Plain host globals such
//! as `this`, `new` or `fs` are only rejected as free identifiers, so they
//! remain usable inside strings and as property names.

use super::lexer::is_ident_continue;
use crate::error::ExpressionError;

pub const FORBIDDEN_IDENTIFIERS: &[&str] = &[
    "eval",
    "Function",
    "constructor",
    "__proto__",
    "prototype",
    "process",
    "require",
    "import",
    "globalThis",
    "child_process",
    "__defineGetter__",
    "__defineSetter__",
    "__lookupGetter__",
    "__lookupSetter__",
    "defineProperty",
    "getPrototypeOf",
    "setPrototypeOf",
];

/// Host globals with no meaning in an expression.
pub const RESERVED_WORDS: &[&str] = &[
    "this",
    "new",
    "window",
    "setTimeout",
    "setInterval",
    "setImmediate",
    "queueMicrotask",
    "fetch",
    "XMLHttpRequest",
    "WebSocket",
    "fs",
    "Deno",
    "Bun",
    "Reflect",
    "Proxy",
];

pub fn is_forbidden(word: &str) -> bool {
    FORBIDDEN_IDENTIFIERS.contains(&word)
}

fn check(word: &str, offset: usize, free: bool) -> Result<(), ExpressionError> {
    if is_forbidden(word) || (free && RESERVED_WORDS.contains(&word)) {
        return Err(ExpressionError::forbidden(
            format!("'{word}' is not allowed in expressions"),
            offset,
        ));
    }
    Ok(())
}

/// Reject `source` if an identifier-like word in it is on a denylist.
pub fn scan(source: &str) -> Result<(), ExpressionError> {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    // Start of the current word and whether it stands as a free identifier.
    let mut word: Option<(usize, bool)> = None;
    let mut prev = ' ';

    for (i, c) in source.char_indices().chain(std::iter::once((source.len(), ' '))) {
        if let Some((start, free)) = word {
            if is_ident_continue(c) {
                continue;
            }
            check(&source[start..i], start, free)?;
            word = None;
            prev = 'a';
        }

        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
                prev = c;
            } else if is_ident_continue(c) {
                word = Some((i, false));
            }
            continue;
        }

        match c {
            '"' | '\'' => quote = Some(c),
            c if is_ident_continue(c) => word = Some((i, prev != '.')),
            _ => {}
        }
        if !c.is_whitespace() {
            prev = c;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_words_at_identifier_boundaries() {
        assert_eq!(scan("$json.constructor").unwrap_err().offset, 6);
        assert!(scan("$json.constructors").is_ok());
        assert!(scan("$json.fs_path").is_ok());
        assert!(scan("'process'").is_err());
    }

    #[test]
    fn reserved_words_only_rejected_as_free_identifiers() {
        assert!(scan("this").is_err());
        assert!(scan("new Date()").is_err());
        assert!(scan("'this is new'").is_ok());
        assert!(scan(r#""say \"new\" fs""#).is_ok());
        assert!(scan("$json.fs").is_ok());
        assert!(scan("$json . window").is_ok());
        assert!(scan("'a' + fetch").is_err());
        assert!(scan("'it\\'s' + this").is_err());
    }
}
