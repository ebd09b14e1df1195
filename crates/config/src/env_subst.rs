/// Replace `${VAR}` and `${VAR:-fallback}` placeholders in raw config text.
///
/// Unresolvable variables without a fallback are left as-is.
pub fn substitute_env(input: &str) -> String {
    substitute_with(input, |name| std::env::var(name).ok())
}

pub(crate) fn substitute_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' || chars.peek() != Some(&'{') {
            result.push(ch);
            continue;
        }
        chars.next(); // '{'

        let mut body = String::new();
        let mut closed = false;
        for c in chars.by_ref() {
            if c == '}' {
                closed = true;
                break;
            }
            body.push(c);
        }

        if !closed || body.is_empty() {
            // Malformed, emit literal.
            result.push_str("${");
            result.push_str(&body);
            continue;
        }

        let (name, fallback) = match body.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (body.as_str(), None),
        };
        match (lookup(name), fallback) {
            (Some(val), _) => result.push_str(&val),
            (None, Some(fallback)) => result.push_str(fallback),
            (None, None) => {
                result.push_str("${");
                result.push_str(&body);
                result.push('}');
            },
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(name: &str) -> Option<String> {
        (name == "SB_TEST_PORT").then(|| "4100".to_string())
    }

    #[test]
    fn substitutes_known_var() {
        assert_eq!(substitute_with("port=${SB_TEST_PORT}", lookup), "port=4100");
    }

    #[test]
    fn uses_fallback_for_unknown_var() {
        assert_eq!(substitute_with("${SB_MISSING:-7}", lookup), "7");
        assert_eq!(substitute_with("${SB_TEST_PORT:-7}", lookup), "4100");
    }

    #[test]
    fn leaves_unknown_var() {
        assert_eq!(substitute_with("${SB_MISSING}", lookup), "${SB_MISSING}");
    }

    #[test]
    fn malformed_placeholder_is_literal() {
        assert_eq!(substitute_with("a ${UNCLOSED", lookup), "a ${UNCLOSED");
        assert_eq!(substitute_with("plain text", lookup), "plain text");
    }
}
