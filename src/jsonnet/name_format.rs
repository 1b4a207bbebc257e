//! Helm object key templates
//!
//! `helmTemplate` keys its output map by rendering a name template against
//! each rendered object. Templates use the Go text/template forms that
//! appear in real nameFormat values: field references, `print`, and the
//! `snakecase`/`lower`/`upper` pipe functions. The default template is
//! [`crate::jsonnet::DEFAULT_NAME_FORMAT`].

use serde_json::Value;

use crate::{Error, Result};

/// Render a name template against a rendered helm object.
pub fn render_name_format(format: &str, obj: &Value) -> Result<String> {
    let mut out = String::new();
    let mut rest = format;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| Error::build(format!("unclosed action in name format {format:?}")))?;
        out.push_str(&eval_action(after[..end].trim(), obj)?);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn eval_action(action: &str, obj: &Value) -> Result<String> {
    let mut stages = action.split('|').map(str::trim);
    let head = stages
        .next()
        .ok_or_else(|| Error::build("empty action in name format".to_string()))?;

    let mut value = eval_term(head, obj)?;
    for func in stages {
        value = match func {
            "snakecase" => snakecase(&value),
            "lower" => value.to_lowercase(),
            "upper" => value.to_uppercase(),
            other => {
                return Err(Error::build(format!(
                    "unsupported function {other:?} in name format"
                )))
            }
        };
    }
    Ok(value)
}

fn eval_term(term: &str, obj: &Value) -> Result<String> {
    if let Some(args) = term.strip_prefix("print ") {
        return split_args(args)?
            .iter()
            .map(|arg| eval_arg(arg, obj))
            .collect::<Result<Vec<_>>>()
            .map(|parts| parts.concat());
    }
    eval_arg(term, obj)
}

fn eval_arg(arg: &str, obj: &Value) -> Result<String> {
    if let Some(quoted) = arg
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    {
        return Ok(quoted.to_string());
    }
    if let Some(path) = arg.strip_prefix('.') {
        let pointer = format!("/{}", path.replace('.', "/"));
        let found = obj.pointer(&pointer).unwrap_or(&Value::Null);
        return Ok(match found {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        });
    }
    Err(Error::build(format!(
        "unsupported argument {arg:?} in name format"
    )))
}

fn split_args(args: &str) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut chars = args.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' => {
                chars.next();
            }
            '"' => {
                let mut lit = String::from('"');
                chars.next();
                for c in chars.by_ref() {
                    lit.push(c);
                    if c == '"' {
                        break;
                    }
                }
                if !lit.ends_with('"') || lit.len() < 2 {
                    return Err(Error::build(format!("unterminated string in {args:?}")));
                }
                out.push(lit);
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c == ' ' {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                out.push(word);
            }
        }
    }
    Ok(out)
}

/// Snake-case conversion matching sprig's `snakecase`: word boundaries
/// before upper-case runs, dashes and spaces collapse to underscores.
fn snakecase(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c == '-' || c == ' ' {
            if !out.ends_with('_') && !out.is_empty() {
                out.push('_');
            }
            continue;
        }
        if c.is_uppercase() {
            let prev_lower = i > 0 && (chars[i - 1].is_lowercase() || chars[i - 1].is_ascii_digit());
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            if (prev_lower || (i > 0 && chars[i - 1].is_uppercase() && next_lower))
                && !out.ends_with('_')
                && !out.is_empty()
            {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out.trim_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonnet::DEFAULT_NAME_FORMAT;
    use serde_json::json;

    fn deployment() -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "grafana", "namespace": "monitoring"},
        })
    }

    /// Story: the default format keys objects as kind_name in snake case
    ///
    /// This is the Tanka-compatible contract: a Deployment named grafana
    /// keys as `deployment_grafana`.
    #[test]
    fn story_default_format_is_tanka_compatible() {
        let key = render_name_format(DEFAULT_NAME_FORMAT, &deployment()).unwrap();
        assert_eq!(key, "deployment_grafana");
    }

    #[test]
    fn test_camel_case_kinds_get_word_boundaries() {
        let obj = json!({
            "kind": "ConfigMap",
            "metadata": {"name": "grafana-dashboards"},
        });
        let key = render_name_format(DEFAULT_NAME_FORMAT, &obj).unwrap();
        assert_eq!(key, "config_map_grafana_dashboards");
    }

    #[test]
    fn test_bare_field_reference() {
        let key = render_name_format("{{ .metadata.name }}", &deployment()).unwrap();
        assert_eq!(key, "grafana");
    }

    #[test]
    fn test_literal_text_around_actions() {
        let key = render_name_format("chart-{{ .kind | lower }}!", &deployment()).unwrap();
        assert_eq!(key, "chart-deployment!");
    }

    #[test]
    fn test_missing_field_renders_empty() {
        let key = render_name_format("{{ .metadata.labels.app }}", &deployment()).unwrap();
        assert_eq!(key, "");
    }

    #[test]
    fn test_unclosed_action_is_an_error() {
        assert!(render_name_format("{{ .kind", &deployment()).is_err());
    }

    #[test]
    fn test_unknown_function_is_an_error() {
        assert!(render_name_format("{{ .kind | reverse }}", &deployment()).is_err());
    }

    #[test]
    fn test_snakecase_acronyms() {
        assert_eq!(snakecase("HTTPServer"), "http_server");
        assert_eq!(snakecase("NoHTTPS"), "no_https");
        assert_eq!(snakecase("Deployment"), "deployment");
        assert_eq!(snakecase("GO-PATH"), "go_path");
        assert_eq!(snakecase("already_snake"), "already_snake");
    }
}
