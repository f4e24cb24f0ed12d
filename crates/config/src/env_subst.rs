/// Replace `${ENV_VAR}` and `${ENV_VAR:-fallback}` placeholders in raw config text.
///
/// Unresolvable variables without a fallback are left as-is.
pub fn substitute_env(input: &str) -> String {
    substitute_with(input, |name| std::env::var(name).ok())
}

/// Placeholder substitution with an explicit variable lookup.
pub fn substitute_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated, emit the remainder literally.
            result.push_str(&rest[start..]);
            return result;
        };

        let body = &after[..end];
        let (name, fallback) = match body.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (body, None),
        };

        match (name.is_empty(), lookup(name), fallback) {
            (false, Some(value), _) => result.push_str(&value),
            (false, None, Some(fallback)) => result.push_str(fallback),
            _ => {
                result.push_str("${");
                result.push_str(body);
                result.push('}');
            },
        }
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(name: &str) -> Option<String> {
        match name {
            "WAGATE_TEST_TOKEN" => Some("s3cret".into()),
            "PORT" => Some("9000".into()),
            _ => None,
        }
    }

    #[test]
    fn substitutes_known_var() {
        assert_eq!(
            substitute_with("api_token = \"${WAGATE_TEST_TOKEN}\"", vars),
            "api_token = \"s3cret\""
        );
    }

    #[test]
    fn multiple_placeholders_on_one_line() {
        assert_eq!(
            substitute_with("${WAGATE_TEST_TOKEN}:${PORT}", vars),
            "s3cret:9000"
        );
    }

    #[test]
    fn leaves_unknown_var() {
        assert_eq!(
            substitute_with("${WAGATE_NONEXISTENT_XYZ}", vars),
            "${WAGATE_NONEXISTENT_XYZ}"
        );
    }

    #[test]
    fn uses_fallback_when_unset() {
        assert_eq!(
            substitute_with("url = \"${WEBHOOK_URL:-http://localhost:9000/hook}\"", vars),
            "url = \"http://localhost:9000/hook\""
        );
        assert_eq!(substitute_with("${PORT:-1}", vars), "9000");
    }

    #[test]
    fn unterminated_placeholder_is_literal() {
        assert_eq!(substitute_with("a ${PORT", vars), "a ${PORT");
    }

    #[test]
    fn no_placeholders() {
        assert_eq!(substitute_with("plain text", vars), "plain text");
    }
}
