//! Template rendering interface and a literal YAML renderer.
//!
//! `LiteralRenderer` treats a template as a YAML document. A top-level
//! `parameter` map declares parameters with their defaults (`null` means no
//! default). Every other key is output, with `{{ path }}` references resolved
//! against `parameter.*` and `context.*`. A string that is exactly one
//! reference takes the referenced value verbatim; embedded references must
//! resolve to scalars.

use serde_json::{Map, Value as Json};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("type mismatch at {field}: expected {expected}, found {found}")]
    TypeMismatch { field: String, expected: String, found: String },
    #[error("missing required field: {0}")]
    MissingField(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    Number,
    String,
    List,
    Object,
    Null,
    /// Computed at render time; type known only after rendering.
    Expr,
}

impl FieldKind {
    pub fn of(v: &Json) -> Self {
        match v {
            Json::Bool(_) => Self::Bool,
            Json::Number(_) => Self::Number,
            Json::String(s) if whole_reference(s).is_some() => Self::Expr,
            Json::String(_) => Self::String,
            Json::Array(_) => Self::List,
            Json::Object(_) => Self::Object,
            Json::Null => Self::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterField {
    pub name: String,
    pub has_default: bool,
}

/// Static shape of a template, used for offline validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateShape {
    pub parameters: Vec<ParameterField>,
    /// Kind of the top-level `enabled` field, when declared.
    pub enabled: Option<FieldKind>,
}

#[async_trait::async_trait]
pub trait TemplateRenderer: Send + Sync {
    /// Evaluate `template` with `parameter` and `context`; returns the output document.
    async fn render(&self, template: &str, parameter: &Json, context: &Json) -> Result<Json, RenderError>;
    fn inspect(&self, template: &str) -> Result<TemplateShape, RenderError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LiteralRenderer;

fn parse(template: &str) -> Result<Map<String, Json>, RenderError> {
    let doc: serde_yaml::Value = serde_yaml::from_str(template).map_err(|e| RenderError::Syntax(e.to_string()))?;
    match serde_json::to_value(doc).map_err(|e| RenderError::Syntax(e.to_string()))? {
        Json::Object(m) => Ok(m),
        Json::Null => Ok(Map::new()),
        other => Err(RenderError::Syntax(format!("template must be a mapping, got {}", kind_name(&other)))),
    }
}

fn kind_name(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "list",
        Json::Object(_) => "object",
    }
}

fn whole_reference(s: &str) -> Option<&str> {
    let t = s.trim();
    let inner = t.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

fn lookup<'a>(scope: &'a Json, path: &str) -> Option<&'a Json> {
    path.split('.').try_fold(scope, |cur, seg| cur.get(seg))
}

fn resolve(v: &Json, scope: &Json, at: &str) -> Result<Json, RenderError> {
    match v {
        Json::String(s) => {
            if let Some(path) = whole_reference(s) {
                return lookup(scope, path).cloned().ok_or_else(|| RenderError::MissingField(path.to_string()));
            }
            interpolate(s, scope, at).map(Json::String)
        }
        Json::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, it)| resolve(it, scope, &format!("{at}[{i}]")))
            .collect::<Result<Vec<_>, _>>()
            .map(Json::Array),
        Json::Object(m) => {
            let mut out = Map::new();
            for (k, vv) in m {
                let child = if at.is_empty() { k.clone() } else { format!("{at}.{k}") };
                out.insert(k.clone(), resolve(vv, scope, &child)?);
            }
            Ok(Json::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn interpolate(s: &str, scope: &Json, at: &str) -> Result<String, RenderError> {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| RenderError::Syntax(format!("unterminated reference in {at}")))?;
        let path = after[..end].trim();
        match lookup(scope, path) {
            Some(Json::String(v)) => out.push_str(v),
            Some(v @ (Json::Number(_) | Json::Bool(_))) => out.push_str(&v.to_string()),
            Some(other) => {
                return Err(RenderError::TypeMismatch {
                    field: at.to_string(),
                    expected: "scalar".into(),
                    found: kind_name(other).into(),
                })
            }
            None => return Err(RenderError::MissingField(path.to_string())),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

#[async_trait::async_trait]
impl TemplateRenderer for LiteralRenderer {
    async fn render(&self, template: &str, parameter: &Json, context: &Json) -> Result<Json, RenderError> {
        let mut doc = parse(template)?;
        let mut params = match doc.remove("parameter") {
            Some(Json::Object(m)) => m,
            Some(Json::Null) | None => Map::new(),
            Some(other) => {
                return Err(RenderError::TypeMismatch {
                    field: "parameter".into(),
                    expected: "object".into(),
                    found: kind_name(&other).into(),
                })
            }
        };
        if let Some(given) = parameter.as_object() {
            for (k, v) in given {
                params.insert(k.clone(), v.clone());
            }
        }
        if let Some((k, _)) = params.iter().find(|(_, v)| v.is_null()) {
            return Err(RenderError::MissingField(format!("parameter.{k}")));
        }
        let scope = serde_json::json!({ "parameter": params, "context": context });
        resolve(&Json::Object(doc), &scope, "")
    }

    fn inspect(&self, template: &str) -> Result<TemplateShape, RenderError> {
        let doc = parse(template)?;
        let parameters = match doc.get("parameter") {
            Some(Json::Object(m)) => m
                .iter()
                .map(|(k, v)| ParameterField { name: k.clone(), has_default: !v.is_null() })
                .collect(),
            _ => Vec::new(),
        };
        Ok(TemplateShape { parameters, enabled: doc.get("enabled").map(FieldKind::of) })
    }
}
