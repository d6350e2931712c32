//! `{{path}}` placeholder resolution and step condition expressions, both
//! evaluated against a workflow's shared context.

use crate::types::WorkflowContext;
use recruitor_core::{RecruitorError, RecruitorResult};
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::LazyLock;

#[allow(clippy::expect_used)]
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("hardcoded placeholder regex is valid")
});

/// Looks up a dotted path (`scrape.profile.name`, `search.hits.0`) in the context.
pub fn lookup<'a>(context: &'a WorkflowContext, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = context.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Resolves every placeholder in an input template.
///
/// A string that is exactly one placeholder becomes the typed context value.
/// Placeholders embedded in longer strings are replaced by the value's text
/// form. A placeholder that does not resolve is an
/// [`RecruitorError::InvalidInput`].
pub fn resolve_input(template: &Value, context: &WorkflowContext) -> RecruitorResult<Value> {
    match template {
        Value::String(s) => resolve_string(s, context),
        Value::Array(items) => items
            .iter()
            .map(|v| resolve_input(v, context))
            .collect::<RecruitorResult<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), resolve_input(v, context)?)))
            .collect::<RecruitorResult<serde_json::Map<_, _>>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

fn resolve_string(s: &str, context: &WorkflowContext) -> RecruitorResult<Value> {
    let re = &*PLACEHOLDER;
    if let Some(caps) = re.captures(s) {
        if caps.get(0).is_some_and(|m| m.start() == 0 && m.end() == s.len()) {
            let path = &caps[1];
            return lookup(context, path).cloned().ok_or_else(|| unresolved(path));
        }
    } else {
        return Ok(Value::String(s.to_string()));
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in re.captures_iter(s) {
        let Some(whole) = caps.get(0) else { continue };
        let path = &caps[1];
        let value = lookup(context, path).ok_or_else(|| unresolved(path))?;
        out.push_str(&s[last..whole.start()]);
        out.push_str(&text_form(value));
        last = whole.end();
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

fn unresolved(path: &str) -> RecruitorError {
    RecruitorError::InvalidInput(format!("unresolved placeholder '{{{{{path}}}}}'"))
}

fn text_form(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// What a condition can see besides the context.
#[derive(Debug, Clone, Copy)]
pub struct ConditionScope<'a> {
    pub context: &'a WorkflowContext,
    /// Most recent step error in the workflow.
    pub last_error: Option<&'a str>,
    /// Whether any dependency of the gated step failed.
    pub failed: bool,
}

impl ConditionScope<'_> {
    fn resolve(&self, path: &str) -> Value {
        match path {
            "error" => self
                .last_error
                .map_or(Value::Null, |e| Value::String(e.to_string())),
            "failed" => Value::Bool(self.failed),
            _ => lookup(self.context, path).cloned().unwrap_or(Value::Null),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    // Two-character operators first so `>=` is not read as `>`.
    const ALL: [(&'static str, CompareOp); 6] = [
        ("==", CompareOp::Eq),
        ("!=", CompareOp::Ne),
        (">=", CompareOp::Ge),
        ("<=", CompareOp::Le),
        (">", CompareOp::Gt),
        ("<", CompareOp::Lt),
    ];
}

#[derive(Debug, Clone, PartialEq)]
enum Atom {
    Truthy(String),
    Not(String),
    Compare(String, CompareOp, Value),
}

/// A parsed `custom` condition: `||`-joined groups of `&&`-joined atoms.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionExpr {
    any_of: Vec<Vec<Atom>>,
}

impl ConditionExpr {
    pub fn parse(source: &str) -> RecruitorResult<Self> {
        let any_of = split_outside_quotes(source, "||")
            .into_iter()
            .map(|group| {
                split_outside_quotes(group, "&&")
                    .into_iter()
                    .map(parse_atom)
                    .collect::<RecruitorResult<Vec<_>>>()
            })
            .collect::<RecruitorResult<Vec<_>>>()?;
        Ok(Self { any_of })
    }

    pub fn evaluate(&self, scope: &ConditionScope<'_>) -> bool {
        self.any_of
            .iter()
            .any(|group| group.iter().all(|atom| eval_atom(atom, scope)))
    }
}

/// Parses and evaluates in one go.
pub fn evaluate_condition(source: &str, scope: &ConditionScope<'_>) -> RecruitorResult<bool> {
    Ok(ConditionExpr::parse(source)?.evaluate(scope))
}

fn split_outside_quotes<'a>(source: &'a str, sep: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut start = 0;
    let bytes = source.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
        } else if b == b'"' {
            in_string = true;
        } else if bytes[i..].starts_with(sep.as_bytes()) {
            parts.push(&source[start..i]);
            i += sep.len();
            start = i;
            continue;
        }
        i += 1;
    }
    parts.push(&source[start..]);
    parts
}

fn find_operator(source: &str) -> Option<(usize, &'static str, CompareOp)> {
    let mut in_string = false;
    for (i, c) in source.char_indices() {
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        for (token, op) in CompareOp::ALL {
            if source[i..].starts_with(token) {
                return Some((i, token, op));
            }
        }
    }
    None
}

fn valid_path(path: &str) -> bool {
    !path.is_empty()
        && path
            .split('.')
            .all(|seg| !seg.is_empty() && seg.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-'))
}

fn parse_atom(raw: &str) -> RecruitorResult<Atom> {
    let atom = raw.trim();
    let invalid = |why: &str| RecruitorError::Workflow(format!("Invalid condition '{atom}': {why}"));

    if let Some((at, token, op)) = find_operator(atom) {
        let path = atom[..at].trim();
        let literal = atom[at + token.len()..].trim();
        if !valid_path(path) {
            return Err(invalid("expected a context path before the operator"));
        }
        let value: Value =
            serde_json::from_str(literal).map_err(|_| invalid("right-hand side is not a JSON literal"))?;
        return Ok(Atom::Compare(path.to_string(), op, value));
    }

    if let Some(path) = atom.strip_prefix('!') {
        let path = path.trim();
        return if valid_path(path) {
            Ok(Atom::Not(path.to_string()))
        } else {
            Err(invalid("expected a context path after '!'"))
        };
    }

    if valid_path(atom) {
        Ok(Atom::Truthy(atom.to_string()))
    } else {
        Err(invalid("expected a context path"))
    }
}

fn eval_atom(atom: &Atom, scope: &ConditionScope<'_>) -> bool {
    match atom {
        Atom::Truthy(path) => truthy(&scope.resolve(path)),
        Atom::Not(path) => !truthy(&scope.resolve(path)),
        Atom::Compare(path, op, literal) => compare(&scope.resolve(path), *op, literal),
    }
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> bool {
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64().zip(b.as_f64()).and_then(|(a, b)| a.partial_cmp(&b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    };
    match op {
        CompareOp::Eq => ordering.map_or(left == right, |o| o == Ordering::Equal),
        CompareOp::Ne => ordering.map_or(left != right, |o| o != Ordering::Equal),
        CompareOp::Gt => ordering == Some(Ordering::Greater),
        CompareOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        CompareOp::Lt => ordering == Some(Ordering::Less),
        CompareOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
    }
}
