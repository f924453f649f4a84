//! Shared nesting- and quote-aware tokenizer.
//!
//! Both the select grammar and the logical-operator grammar split their
//! input on top-level commas; using one scanner for both guarantees
//! identical nesting semantics everywhere.

use serde_json::Value;

/// Split `input` on `sep`, ignoring separators inside parentheses and
/// inside single or double quotes. Empty tokens are dropped.
pub fn split_top_level(input: &str, sep: char) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut depth: u32 = 0;
    let mut quote: Option<char> = None;

    for c in input.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    current.push(c);
                }
                '(' => {
                    depth += 1;
                    current.push(c);
                }
                ')' => {
                    depth = depth.saturating_sub(1);
                    current.push(c);
                }
                _ if c == sep && depth == 0 => {
                    let token = current.trim().to_string();
                    if !token.is_empty() {
                        tokens.push(token);
                    }
                    current.clear();
                }
                _ => current.push(c),
            },
        }
    }

    let token = current.trim().to_string();
    if !token.is_empty() {
        tokens.push(token);
    }
    tokens
}

/// Return the inner text when `s` is fully wrapped in one pair of
/// parentheses, i.e. `(a,b)` -> `a,b`. The closing paren must match the
/// opening one at depth zero.
pub fn strip_outer_parens(s: &str) -> Option<&str> {
    let s = s.trim();
    if !s.starts_with('(') || !s.ends_with(')') || s.len() < 2 {
        return None;
    }
    let mut depth = 0u32;
    let mut quote: Option<char> = None;
    for (i, c) in s.char_indices() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                '(' => depth += 1,
                ')' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 && i != s.len() - 1 {
                        // closes before the end, not a single outer pair
                        return None;
                    }
                }
                _ => {}
            },
        }
    }
    Some(&s[1..s.len() - 1])
}

/// Split a token of the form `name(body)` into its parts. `name` must be
/// non-empty and the closing paren must be the last character.
pub fn parse_call(token: &str) -> Option<(&str, &str)> {
    let token = token.trim();
    let open = token.find('(')?;
    if open == 0 || !token.ends_with(')') {
        return None;
    }
    let name = &token[..open];
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return None;
    }
    Some((name, &token[open + 1..token.len() - 1]))
}

/// Strip a single layer of matching quotes, if present.
pub fn strip_quotes(s: &str) -> Option<&str> {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"'))
            || (s.starts_with('\'') && s.ends_with('\'')))
    {
        Some(&s[1..s.len() - 1])
    } else {
        None
    }
}

fn is_int_literal(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

fn is_float_literal(s: &str) -> bool {
    match s.strip_prefix('-').unwrap_or(s).split_once('.') {
        Some((int, frac)) => {
            !int.is_empty()
                && !frac.is_empty()
                && int.chars().all(|c| c.is_ascii_digit())
                && frac.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

/// Coerce a raw textual value into a typed JSON value.
///
/// Order: literal `null`, booleans, all-digit integers, `digits.digits`
/// floats, quoted strings (unquoted), anything else as the raw string.
pub fn coerce_value(raw: &str) -> Value {
    let raw = raw.trim();
    if raw == "null" {
        return Value::Null;
    }
    if raw == "true" {
        return Value::Bool(true);
    }
    if raw == "false" {
        return Value::Bool(false);
    }
    if is_int_literal(raw) {
        if let Ok(n) = raw.parse::<i64>() {
            return Value::from(n);
        }
    }
    if is_float_literal(raw) {
        if let Ok(n) = raw.parse::<f64>() {
            return Value::from(n);
        }
    }
    if let Some(inner) = strip_quotes(raw) {
        return Value::String(inner.to_string());
    }
    Value::String(raw.to_string())
}

/// Coerce a parenthesized comma-list into an array value, splitting only
/// on top-level commas. A bare scalar becomes a single-element array.
pub fn coerce_set_value(raw: &str) -> Value {
    let inner = strip_outer_parens(raw).unwrap_or(raw);
    let items: Vec<Value> = split_top_level(inner, ',')
        .iter()
        .map(|t| coerce_value(t))
        .collect();
    Value::Array(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_respects_nesting() {
        assert_eq!(
            split_top_level("a,b(c,d),e", ','),
            vec!["a", "b(c,d)", "e"]
        );
        assert_eq!(
            split_top_level("posts(title,comments(text)),name", ','),
            vec!["posts(title,comments(text))", "name"]
        );
    }

    #[test]
    fn test_split_respects_quotes() {
        assert_eq!(
            split_top_level("name.eq.'a,b',age.gt.5", ','),
            vec!["name.eq.'a,b'", "age.gt.5"]
        );
    }

    #[test]
    fn test_strip_outer_parens() {
        assert_eq!(strip_outer_parens("(a,b)"), Some("a,b"));
        assert_eq!(strip_outer_parens("(a),(b)"), None);
        assert_eq!(strip_outer_parens("a,b"), None);
        assert_eq!(strip_outer_parens("((x))"), Some("(x)"));
    }

    #[test]
    fn test_strip_outer_parens_ignores_quoted_parens() {
        assert_eq!(
            strip_outer_parens(r#"(name.eq."a)b",x.eq.1)"#),
            Some(r#"name.eq."a)b",x.eq.1"#)
        );
        assert_eq!(strip_outer_parens("('(a'),(b)"), None);
    }

    #[test]
    fn test_parse_call() {
        assert_eq!(parse_call("posts(title)"), Some(("posts", "title")));
        assert_eq!(parse_call("look_posts(a,b)"), Some(("look_posts", "a,b")));
        assert_eq!(parse_call("plainfield"), None);
        assert_eq!(parse_call("(a,b)"), None);
    }

    #[test]
    fn test_coercion_ladder() {
        assert_eq!(coerce_value("null"), Value::Null);
        assert_eq!(coerce_value("true"), json!(true));
        assert_eq!(coerce_value("false"), json!(false));
        assert_eq!(coerce_value("25"), json!(25));
        assert_eq!(coerce_value("-3"), json!(-3));
        assert_eq!(coerce_value("3.14"), json!(3.14));
        assert_eq!(coerce_value("'hello'"), json!("hello"));
        assert_eq!(coerce_value("\"w o rld\""), json!("w o rld"));
        assert_eq!(coerce_value("John"), json!("John"));
        // not digits.digits, stays a raw string
        assert_eq!(coerce_value("1.2.3"), json!("1.2.3"));
    }

    #[test]
    fn test_set_coercion_preserves_order() {
        assert_eq!(
            coerce_set_value("(active,pending)"),
            json!(["active", "pending"])
        );
        assert_eq!(coerce_set_value("(1,2,3)"), json!([1, 2, 3]));
        // commas inside quotes stay inside one element
        assert_eq!(coerce_set_value("('a,b',c)"), json!(["a,b", "c"]));
    }
}
