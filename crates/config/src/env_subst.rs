/// Replace `${ENV_VAR}` placeholders in raw config text.
///
/// Unresolvable variables are left as-is so validation can point at them.
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
        chars.next();
        let mut var_name = String::new();
        let mut closed = false;
        for c in chars.by_ref() {
            if c == '}' {
                closed = true;
                break;
            }
            var_name.push(c);
        }
        match (closed && !var_name.is_empty())
            .then(|| lookup(&var_name))
            .flatten()
        {
            Some(val) => result.push_str(&val),
            None => {
                result.push_str("${");
                result.push_str(&var_name);
                if closed {
                    result.push('}');
                }
            },
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(name: &str) -> Option<String> {
        (name == "CLAWGATE_TOKEN").then(|| "s3cret".to_string())
    }

    #[test]
    fn substitutes_known_var() {
        assert_eq!(
            substitute_with(r#"{"token": "${CLAWGATE_TOKEN}"}"#, lookup),
            r#"{"token": "s3cret"}"#
        );
    }

    #[test]
    fn leaves_unknown_var() {
        assert_eq!(substitute_with("${NOPE_XYZ}", lookup), "${NOPE_XYZ}");
    }

    #[test]
    fn unterminated_placeholder_is_literal() {
        assert_eq!(substitute_with("a ${CLAWGATE_TOKEN", lookup), "a ${CLAWGATE_TOKEN");
    }

    #[test]
    fn reads_process_environment() {
        let Ok(path) = std::env::var("PATH") else {
            return;
        };
        assert_eq!(substitute_env("${PATH}"), path);
    }

    #[test]
    fn no_placeholders() {
        assert_eq!(substitute_env("plain $text"), "plain $text");
    }
}
