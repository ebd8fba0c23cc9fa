use std::borrow::Cow;

use serde_json::Value;

use crate::state_machine::ExecutionContext;

/// Parameters after placeholder substitution.
#[derive(Debug, Clone, PartialEq)]
pub struct Substituted {
    pub value: Value,
    /// Placeholder names with no visible variable, left in place as literal text.
    pub unresolved: Vec<String>,
}

/// Replaces `{name}` tokens in every string inside `params`.
///
/// Object keys are left alone; arrays and nested objects are walked.
pub fn substitute(params: &Value, ctx: &ExecutionContext) -> Substituted {
    let mut unresolved = Vec::new();
    let value = walk(params, ctx, &mut unresolved);
    unresolved.sort();
    unresolved.dedup();
    Substituted { value, unresolved }
}

fn walk(value: &Value, ctx: &ExecutionContext, unresolved: &mut Vec<String>) -> Value {
    match value {
        Value::String(s) => Value::String(substitute_str(s, |name| ctx.lookup(name), unresolved)),
        Value::Array(items) => Value::Array(items.iter().map(|v| walk(v, ctx, unresolved)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), walk(v, ctx, unresolved)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}

/// Single left-to-right pass over `template`.
///
/// Inserted values are never rescanned, so braces inside a value cannot
/// create or remove placeholders.
pub fn substitute_str<'a, F>(template: &str, lookup: F, unresolved: &mut Vec<String>) -> String
where
    F: Fn(&str) -> Option<Cow<'a, str>>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];

        let name_len = after.find(|c: char| !is_name_char(c)).unwrap_or(after.len());
        let closes = after[name_len..].starts_with('}');
        if name_len == 0 || !closes {
            out.push('{');
            rest = after;
            continue;
        }

        let name = &after[..name_len];
        match lookup(name) {
            Some(value) => out.push_str(&value),
            None => {
                out.push('{');
                out.push_str(name);
                out.push('}');
                unresolved.push(name.to_string());
            }
        }
        rest = &after[name_len + 1..];
    }
    out.push_str(rest);
    out
}
