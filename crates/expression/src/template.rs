//! Template scanning and rendering.
//!
//! A template is a string mixing static text with `{{expr}}` references.
//! Parsing happens once; the parsed parts are cached on the [`Template`].

use serde_json::Value;

use crate::context::EvalContext;
use crate::error::ExpressionError;
use crate::path::Path;

/// Upper bound on expressions per template.
const MAX_TEMPLATE_EXPRESSIONS: usize = 1000;

/// A template part — static text or an expression to evaluate.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    /// Static text copied through verbatim.
    Static(String),
    /// A `{{path | default(...)}}` reference.
    Expression {
        /// The parsed path.
        path: Path,
        /// Fallback applied when the path resolves to null/missing.
        default: Option<Value>,
    },
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    source: String,
    parts: Vec<TemplatePart>,
}

impl Template {
    /// Parse a template, caching its structure.
    pub fn parse(source: impl Into<String>) -> Result<Self, ExpressionError> {
        let source = source.into();
        let parts = scan(&source)?;
        Ok(Self { source, parts })
    }

    /// The original source text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The parsed parts.
    #[must_use]
    pub fn parts(&self) -> &[TemplatePart] {
        &self.parts
    }

    /// Whether the template contains any expression at all.
    #[must_use]
    pub fn has_expressions(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, TemplatePart::Expression { .. }))
    }

    /// The head identifiers of every referenced path, in source order.
    #[must_use]
    pub fn references(&self) -> Vec<String> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                TemplatePart::Expression { path, .. } => Some(path.head().to_owned()),
                TemplatePart::Static(_) => None,
            })
            .collect()
    }

    /// Render the template against a context.
    ///
    /// If the whole source is one expression, the referenced value is
    /// returned with its original type. Otherwise each expression is
    /// stringified (objects/arrays as JSON, scalars bare, null as the empty
    /// string) into the surrounding text.
    pub fn resolve(&self, ctx: &EvalContext<'_>) -> Result<Value, ExpressionError> {
        tracing::trace!(source = %self.source, "rendering template");

        if let [TemplatePart::Expression { path, default }] = self.parts.as_slice() {
            return resolve_expr(ctx, path, default.as_ref());
        }

        let mut rendered = String::with_capacity(self.source.len());
        for part in &self.parts {
            match part {
                TemplatePart::Static(text) => rendered.push_str(text),
                TemplatePart::Expression { path, default } => {
                    let value = resolve_expr(ctx, path, default.as_ref())?;
                    rendered.push_str(&stringify(&value));
                }
            }
        }
        Ok(Value::String(rendered))
    }
}

fn resolve_expr(
    ctx: &EvalContext<'_>,
    path: &Path,
    default: Option<&Value>,
) -> Result<Value, ExpressionError> {
    match ctx.resolve(path) {
        Some(Value::Null) | None => match default {
            Some(fallback) => Ok(fallback.clone()),
            None if ctx.is_strict() => Err(ExpressionError::missing(path.to_string())),
            None => Ok(Value::Null),
        },
        Some(value) => Ok(value),
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => {
            serde_json::to_string(value).unwrap_or_default()
        }
    }
}

/// Deep-resolve every string in a JSON value tree.
///
/// Strings are treated as templates; arrays and objects recurse; other
/// scalars pass through unchanged.
pub fn resolve_value(
    value: &Value,
    ctx: &EvalContext<'_>,
) -> Result<Value, ExpressionError> {
    match value {
        Value::String(s) => Template::parse(s.as_str())?.resolve(ctx),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| resolve_value(v, ctx).map(|r| (k.clone(), r)))
            .collect::<Result<serde_json::Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Collect referenced head identifiers from every string in a value tree.
///
/// Malformed templates are skipped — validation reports them separately.
#[must_use]
pub fn references_in_value(value: &Value) -> Vec<String> {
    let mut refs = Vec::new();
    collect_refs(value, &mut refs);
    refs
}

fn collect_refs(value: &Value, refs: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            if let Ok(template) = Template::parse(s.as_str()) {
                refs.extend(template.references());
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_refs(item, refs);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_refs(item, refs);
            }
        }
        _ => {}
    }
}

// ── Scanner ─────────────────────────────────────────────────────────────────

fn scan(source: &str) -> Result<Vec<TemplatePart>, ExpressionError> {
    let mut parts = Vec::new();
    let mut rest = source;
    let mut offset = 0;
    let mut expr_count = 0;

    while let Some(open) = rest.find("{{") {
        if open > 0 {
            parts.push(TemplatePart::Static(rest[..open].to_owned()));
        }
        let after_open = &rest[open + 2..];
        let close = after_open
            .find("}}")
            .ok_or_else(|| ExpressionError::parse(offset + open, "unterminated expression"))?;

        expr_count += 1;
        if expr_count > MAX_TEMPLATE_EXPRESSIONS {
            return Err(ExpressionError::parse(
                offset + open,
                "too many expressions in template",
            ));
        }

        let inner = &after_open[..close];
        parts.push(parse_expression(inner, offset + open + 2)?);

        rest = &after_open[close + 2..];
        offset += open + 2 + close + 2;
    }

    if !rest.is_empty() {
        parts.push(TemplatePart::Static(rest.to_owned()));
    }
    Ok(parts)
}

fn parse_expression(inner: &str, offset: usize) -> Result<TemplatePart, ExpressionError> {
    let (path_text, default) = match inner.find('|') {
        Some(pipe) => {
            let filter = inner[pipe + 1..].trim();
            let literal = filter
                .strip_prefix("default")
                .map(str::trim_start)
                .and_then(|rest| rest.strip_prefix('('))
                .and_then(|rest| rest.strip_suffix(')'))
                .ok_or_else(|| {
                    ExpressionError::parse(offset + pipe, "only `default(literal)` is supported")
                })?;
            (&inner[..pipe], Some(parse_literal(literal.trim(), offset + pipe)?))
        }
        None => (inner, None),
    };

    let path = Path::parse(path_text.trim())?;
    Ok(TemplatePart::Expression { path, default })
}

fn parse_literal(text: &str, offset: usize) -> Result<Value, ExpressionError> {
    // JSON literals, plus single-quoted strings for YAML friendliness.
    if let Some(stripped) = text
        .strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix('\''))
    {
        return Ok(Value::String(stripped.to_owned()));
    }
    serde_json::from_str(text)
        .map_err(|_| ExpressionError::parse(offset, format!("invalid literal {text:?}")))
}
