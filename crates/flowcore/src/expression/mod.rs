//! Sandboxed `{{ ... }}` template expressions.
//!
//! A template is a string with zero or more `{{ expr }}` blocks. When a
//! single block makes up the whole (trimmed) string, the block's native
//! value is returned; otherwise every block is rendered to a string and
//! spliced into the surrounding text.
//!
//! Expressions are lexed, parsed and interpreted by hand-written code over
//! [`serde_json::Value`]; there is no host-language evaluation. Each
//! evaluation runs under [`ExpressionLimits`].

mod ast;
mod forbidden;
mod functions;
mod interpreter;
mod lexer;
mod parser;

pub use forbidden::{FORBIDDEN_IDENTIFIERS, RESERVED_WORDS};
pub use functions::{format_datetime as format_timestamp, function_names};
pub use parser::VARIABLES;

use crate::context::ExpressionContext;
use crate::error::ExpressionError;
use crate::value::{Map, Value, ValueExt};
use interpreter::Budget;
use serde::{Deserialize, Serialize};

type Result<T> = std::result::Result<T, ExpressionError>;

/// Per-evaluation resource limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpressionLimits {
    pub max_duration_ms: u64,
    pub max_steps: u64,
    pub max_string_length: usize,
    pub max_collection_length: usize,
    pub max_depth: usize,
}

impl Default for ExpressionLimits {
    fn default() -> Self {
        Self {
            max_duration_ms: 1000,
            max_steps: 100_000,
            max_string_length: 1_000_000,
            max_collection_length: 10_000,
            max_depth: 64,
        }
    }
}

/// True if `s` contains a `{{` block opener.
pub fn contains_expression(s: &str) -> bool {
    s.contains("{{")
}

/// Evaluate `template` with the given limits.
pub fn evaluate(template: &str, ctx: &ExpressionContext, limits: &ExpressionLimits) -> Result<Value> {
    ExpressionEngine::new(limits.clone()).evaluate(template, ctx)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment<'s> {
    Text(&'s str),
    /// Block body and its byte offset in the template.
    Block(&'s str, usize),
}

/// Split a template into literal text and block bodies. A `}}` inside a
/// string literal or an object literal does not close the block.
fn split_template(template: &str) -> Result<Vec<Segment<'_>>> {
    let bytes = template.as_bytes();
    let mut segments = Vec::new();
    let mut text_start = 0;
    let mut i = 0;

    while i + 1 < bytes.len() {
        if !(bytes[i] == b'{' && bytes[i + 1] == b'{') {
            i += 1;
            continue;
        }
        let open = i;
        let body_start = i + 2;
        let body_end = find_block_end(bytes, body_start)
            .ok_or_else(|| ExpressionError::syntax("unclosed '{{' block", open))?;

        if open > text_start {
            segments.push(Segment::Text(&template[text_start..open]));
        }
        segments.push(Segment::Block(&template[body_start..body_end], body_start));
        i = body_end + 2;
        text_start = i;
    }

    if text_start < template.len() {
        segments.push(Segment::Text(&template[text_start..]));
    }
    Ok(segments)
}

/// Byte index of the `}}` closing the block whose body starts at `start`.
fn find_block_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut quote: Option<u8> = None;
    let mut depth = 0usize;
    let mut i = start;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b'{' => depth += 1,
                b'}' if depth > 0 => depth -= 1,
                b'}' if bytes.get(i + 1) == Some(&b'}') => return Some(i),
                _ => {}
            },
        }
        i += 1;
    }
    None
}

/// Evaluates templates under a fixed set of limits.
#[derive(Debug, Clone, Default)]
pub struct ExpressionEngine {
    limits: ExpressionLimits,
}

impl ExpressionEngine {
    pub fn new(limits: ExpressionLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ExpressionLimits {
        &self.limits
    }

    /// Evaluate one template. Strings without `{{` come back unchanged.
    pub fn evaluate(&self, template: &str, ctx: &ExpressionContext) -> Result<Value> {
        if !contains_expression(template) {
            return Ok(Value::String(template.to_string()));
        }
        if template.len() > self.limits.max_string_length {
            return Err(ExpressionError::exceeded(
                format!(
                    "template of {} bytes exceeds the limit of {}",
                    template.len(),
                    self.limits.max_string_length
                ),
                0,
            ));
        }

        let segments = split_template(template)?;
        let mut budget = Budget::new(&self.limits);

        if let Some((source, offset)) = sole_block(&segments) {
            return self.eval_block(source, offset, ctx, &mut budget);
        }

        let mut out = String::new();
        for segment in &segments {
            match *segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Block(source, offset) => {
                    let value = self.eval_block(source, offset, ctx, &mut budget)?;
                    out.push_str(&value.to_display_string());
                }
            }
            budget.check_string(out.len(), 0)?;
        }
        Ok(Value::String(out))
    }

    fn eval_block(
        &self,
        source: &str,
        offset: usize,
        ctx: &ExpressionContext,
        budget: &mut Budget,
    ) -> Result<Value> {
        let expr = self.parse_block(source, offset)?;
        interpreter::evaluate(&expr, ctx, budget).map_err(|e| e.shifted(offset))
    }

    fn parse_block(&self, source: &str, offset: usize) -> Result<ast::Expr> {
        forbidden::scan(source).map_err(|e| e.shifted(offset))?;
        parser::parse(source, self.limits.max_depth).map_err(|e| e.shifted(offset))
    }

    /// Static check of a template: block structure, denylist and syntax.
    /// Nothing is evaluated.
    pub fn check(&self, template: &str) -> Result<()> {
        if !contains_expression(template) {
            return Ok(());
        }
        for segment in split_template(template)? {
            if let Segment::Block(source, offset) = segment {
                self.parse_block(source, offset)?;
            }
        }
        Ok(())
    }

    /// Resolve every expression-bearing string leaf of a config tree.
    /// Object keys are kept verbatim. Errors name the failing path.
    pub fn resolve_config(&self, config: &Value, ctx: &ExpressionContext) -> Result<Value> {
        self.resolve_at(config, ctx, &mut String::new())
    }

    fn resolve_at(&self, value: &Value, ctx: &ExpressionContext, path: &mut String) -> Result<Value> {
        match value {
            Value::String(s) if contains_expression(s) => self.evaluate(s, ctx).map_err(|mut e| {
                if !path.is_empty() {
                    e.message = format!("{} (at '{}')", e.message, path);
                }
                e
            }),
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    let len = path.len();
                    path.push_str(&format!("[{i}]"));
                    let resolved = self.resolve_at(item, ctx, path);
                    path.truncate(len);
                    out.push(resolved?);
                }
                Ok(Value::Array(out))
            }
            Value::Object(map) => {
                let mut out = Map::new();
                for (key, item) in map {
                    let len = path.len();
                    if !path.is_empty() {
                        path.push('.');
                    }
                    path.push_str(key);
                    let resolved = self.resolve_at(item, ctx, path);
                    path.truncate(len);
                    out.insert(key.clone(), resolved?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    /// Check every string leaf of a config tree; returns `(path, error)` pairs.
    pub fn check_config(&self, config: &Value) -> Vec<(String, ExpressionError)> {
        let mut problems = Vec::new();
        self.check_at(config, String::new(), &mut problems);
        problems
    }

    fn check_at(&self, value: &Value, path: String, problems: &mut Vec<(String, ExpressionError)>) {
        match value {
            Value::String(s) => {
                if let Err(e) = self.check(s) {
                    problems.push((path, e));
                }
            }
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    self.check_at(item, format!("{path}[{i}]"), problems);
                }
            }
            Value::Object(map) => {
                for (key, item) in map {
                    let child = if path.is_empty() {
                        key.clone()
                    } else {
                        format!("{path}.{key}")
                    };
                    self.check_at(item, child, problems);
                }
            }
            _ => {}
        }
    }
}

/// The block body when the template is exactly one block plus whitespace.
fn sole_block<'s>(segments: &[Segment<'s>]) -> Option<(&'s str, usize)> {
    let mut block = None;
    for segment in segments {
        match *segment {
            Segment::Text(text) if text.trim().is_empty() => {}
            Segment::Text(_) => return None,
            Segment::Block(source, offset) => {
                if block.is_some() {
                    return None;
                }
                block = Some((source, offset));
            }
        }
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_text_and_blocks() {
        let segments = split_template("Hi {{ $json.name }}!").unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::Text("Hi "),
                Segment::Block(" $json.name ", 5),
                Segment::Text("!"),
            ]
        );
    }

    #[test]
    fn closing_braces_inside_literals_do_not_end_the_block() {
        let segments = split_template("{{ '}}' + {a: {b: 1}}.a.b }}").unwrap();
        assert_eq!(segments.len(), 1);
        assert!(matches!(segments[0], Segment::Block(src, 2) if src.contains("{b: 1}")));
    }

    #[test]
    fn unclosed_block_is_a_syntax_error() {
        let err = split_template("a {{ $json").unwrap_err();
        assert_eq!(err.offset, 2);
    }

    #[test]
    fn sole_block_ignores_surrounding_whitespace() {
        let segments = split_template("  {{ 1 }} ").unwrap();
        assert_eq!(sole_block(&segments), Some((" 1 ", 4)));
        let segments = split_template("{{ 1 }}{{ 2 }}").unwrap();
        assert_eq!(sole_block(&segments), None);
    }
}
