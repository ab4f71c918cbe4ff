//! Pure parsing helpers for the Dockerfile-instruction arguments
//! `generate_image_config` mutates `config.config` from, per spec.md
//! §4.3.1's instruction table. Kept independently testable and free of the
//! `oci_spec` types the rest of `manifest` builds against.

use super::HealthCheck;

/// Parse a `CMD`/`ENTRYPOINT`/`SHELL`-style argument: a JSON array if the
/// trimmed value looks like one, otherwise the whole value wrapped as a
/// single-element shell invocation (`["/bin/sh", "-c", value]`).
pub fn parse_cmd_like(value: &str) -> Vec<String> {
    let trimmed = value.trim();
    if trimmed.starts_with('[') {
        if let Ok(items) = serde_json::from_str::<Vec<String>>(trimmed) {
            return items;
        }
    }
    vec!["/bin/sh".to_string(), "-c".to_string(), trimmed.to_string()]
}

/// Parse an `ENV` argument in either `KEY=VAL` or `KEY VAL` form, returning
/// the normalized `KEY=VAL` string to append to `config.config.env`.
pub fn parse_env(value: &str) -> Result<String, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("ENV requires a KEY=VAL or KEY VAL argument".to_string());
    }
    if let Some((key, val)) = trimmed.split_once('=') {
        return Ok(format!("{key}={val}"));
    }
    if let Some((key, val)) = trimmed.split_once(char::is_whitespace) {
        return Ok(format!("{key}={}", val.trim()));
    }
    Err(format!("ENV argument {trimmed:?} has neither '=' nor whitespace"))
}

/// Parse an `EXPOSE` argument: whitespace-separated tokens, each normalized
/// to `port/proto` with `tcp` as the default protocol.
pub fn parse_expose(value: &str) -> Vec<String> {
    value
        .split_whitespace()
        .map(|token| {
            if token.contains('/') {
                token.to_string()
            } else {
                format!("{token}/tcp")
            }
        })
        .collect()
}

/// Parse a `LABEL` argument: one or more `key=value` pairs, with
/// surrounding double or single quotes stripped from each side.
pub fn parse_label(value: &str) -> Vec<(String, String)> {
    shell_words_like_split(value)
        .into_iter()
        .filter_map(|pair| {
            let (key, val) = pair.split_once('=')?;
            Some((unquote(key), unquote(val)))
        })
        .collect()
}

/// Parse a `HEALTHCHECK` argument: `NONE` disables the inherited
/// healthcheck; `CMD <rest>` becomes a shell-form test.
pub fn parse_healthcheck(value: &str) -> HealthCheck {
    let trimmed = value.trim();
    if trimmed.eq_ignore_ascii_case("none") {
        return HealthCheck {
            test: vec!["NONE".to_string()],
        };
    }
    let rest = trimmed
        .strip_prefix("CMD-SHELL")
        .or_else(|| trimmed.strip_prefix("CMD"))
        .unwrap_or(trimmed)
        .trim();
    HealthCheck {
        test: vec!["CMD-SHELL".to_string(), rest.to_string()],
    }
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    for quote in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}

/// Split on whitespace, respecting single- and double-quoted spans so a
/// quoted LABEL value may itself contain spaces.
fn shell_words_like_split(value: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in value.chars() {
        match quote {
            Some(q) if c == q => {
                current.push(c);
                quote = None;
            }
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                current.push(c);
            }
            None if c.is_whitespace() => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            None => current.push(c),
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cmd_like_accepts_json_array() {
        assert_eq!(
            parse_cmd_like(r#"["/bin/sh", "-c", "echo hi"]"#),
            vec!["/bin/sh".to_string(), "-c".to_string(), "echo hi".to_string()]
        );
    }

    #[test]
    fn parse_cmd_like_wraps_shell_form() {
        assert_eq!(
            parse_cmd_like("echo hi"),
            vec!["/bin/sh".to_string(), "-c".to_string(), "echo hi".to_string()]
        );
    }

    #[test]
    fn parse_env_accepts_equals_and_space_forms() {
        assert_eq!(parse_env("KEY=value").unwrap(), "KEY=value");
        assert_eq!(parse_env("KEY value").unwrap(), "KEY=value");
    }

    #[test]
    fn parse_env_rejects_missing_value() {
        assert!(parse_env("KEY").is_err());
    }

    #[test]
    fn parse_expose_defaults_to_tcp() {
        assert_eq!(
            parse_expose("80 443/udp 8080/tcp"),
            vec!["80/tcp".to_string(), "443/udp".to_string(), "8080/tcp".to_string()]
        );
    }

    #[test]
    fn parse_label_strips_quotes() {
        assert_eq!(
            parse_label(r#"maintainer="Jane Doe" version=1.0"#),
            vec![
                ("maintainer".to_string(), "Jane Doe".to_string()),
                ("version".to_string(), "1.0".to_string()),
            ]
        );
    }

    #[test]
    fn parse_healthcheck_none() {
        assert_eq!(parse_healthcheck("NONE").test, vec!["NONE".to_string()]);
    }

    #[test]
    fn parse_healthcheck_cmd() {
        assert_eq!(
            parse_healthcheck("CMD curl -f http://localhost/ || exit 1").test,
            vec!["CMD-SHELL".to_string(), "curl -f http://localhost/ || exit 1".to_string()]
        );
    }
}
