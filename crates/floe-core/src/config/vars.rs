//! Environment variable interpolation for config files.
//!
//! Connection strings and storage credentials usually come from the
//! environment rather than the YAML itself.
//!
//! - `$VAR` or `${VAR}` substitutes, error if missing
//! - `${VAR:-default}` uses default if VAR is unset or empty
//! - `${VAR-default}` uses default only if VAR is unset
//! - `$$` is a literal `$`

use regex::Regex;
use std::env;
use std::sync::LazyLock;

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \$\$                           # escaped $
        |
        \$\{
            ([A-Za-z_][A-Za-z0-9_]*)   # 1: name
            (?:
                (:?-)                  # 2: default operator
                ([^}]*)                # 3: default value
            )?
        \}
        |
        \$([A-Za-z_][A-Za-z0-9_]*)     # 4: unbraced name
        ",
    )
    .expect("Invalid regex pattern")
});

/// Interpolated text plus every variable that could not be resolved.
#[derive(Debug)]
pub struct InterpolationResult {
    pub text: String,
    pub errors: Vec<String>,
}

impl InterpolationResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Interpolate environment variables in `input`.
///
/// Errors accumulate so every missing variable is reported at once.
pub fn interpolate(input: &str) -> InterpolationResult {
    let mut errors = Vec::new();

    let text = ENV_VAR_PATTERN
        .replace_all(input, |caps: &regex::Captures| {
            let full_match = &caps[0];
            if full_match == "$$" {
                return "$".to_string();
            }

            let var_name = caps
                .get(1)
                .or_else(|| caps.get(4))
                .map(|m| m.as_str())
                .unwrap_or("");
            let operator = caps.get(2).map(|m| m.as_str());
            let default_value = caps.get(3).map(|m| m.as_str());

            match env::var(var_name) {
                Ok(value) if value.contains('\n') || value.contains('\r') => {
                    errors.push(format!(
                        "environment variable '{var_name}' contains newlines, which is not allowed"
                    ));
                    full_match.to_string()
                }
                Ok(value) if value.is_empty() && operator == Some(":-") => {
                    default_value.unwrap_or("").to_string()
                }
                Ok(value) => value,
                Err(_) => match default_value {
                    Some(default) => default.to_string(),
                    None => {
                        errors.push(format!("environment variable '{var_name}' is not set"));
                        full_match.to_string()
                    }
                },
            }
        })
        .to_string();

    InterpolationResult { text, errors }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Runs `f` with the given variables set (or removed), restoring them afterwards.
    /// Every test uses its own variable names so parallel tests never collide.
    fn with_env_vars<R>(vars: &[(&str, Option<&str>)], f: impl FnOnce() -> R) -> R {
        let originals: Vec<_> = vars.iter().map(|(k, _)| (*k, env::var(k).ok())).collect();

        // SAFETY: variable names are unique per test
        for (key, value) in vars {
            match value {
                Some(v) => unsafe { env::set_var(key, v) },
                None => unsafe { env::remove_var(key) },
            }
        }

        let result = f();

        // SAFETY: restores the state captured above
        for (key, original) in originals {
            match original {
                Some(v) => unsafe { env::set_var(key, v) },
                None => unsafe { env::remove_var(key) },
            }
        }

        result
    }

    #[test]
    fn test_connection_string_substitution() {
        with_env_vars(&[("FLOE_TEST_SQL_PASSWORD", Some("s3cret"))], || {
            let result = interpolate("connection_string: Server=db;Password=${FLOE_TEST_SQL_PASSWORD}");
            assert!(result.is_ok());
            assert_eq!(result.text, "connection_string: Server=db;Password=s3cret");
        });
    }

    #[test]
    fn test_unbraced_substitution() {
        with_env_vars(&[("FLOE_TEST_WORKSPACE", Some("sales"))], || {
            let result = interpolate("uri: abfss://$FLOE_TEST_WORKSPACE@onelake");
            assert_eq!(result.text, "uri: abfss://sales@onelake");
        });
    }

    #[test]
    fn test_missing_variables_all_reported() {
        with_env_vars(
            &[("FLOE_TEST_MISSING_A", None), ("FLOE_TEST_MISSING_B", None)],
            || {
                let result = interpolate("a: $FLOE_TEST_MISSING_A\nb: ${FLOE_TEST_MISSING_B}");
                assert_eq!(result.errors.len(), 2);
                assert!(result.errors[0].contains("FLOE_TEST_MISSING_A"));
                assert!(result.errors[1].contains("not set"));
            },
        );
    }

    #[test]
    fn test_defaults() {
        with_env_vars(
            &[("FLOE_TEST_UNSET", None), ("FLOE_TEST_EMPTY", Some(""))],
            || {
                assert_eq!(interpolate("${FLOE_TEST_UNSET:-10}").text, "10");
                assert_eq!(interpolate("${FLOE_TEST_UNSET-10}").text, "10");
                assert_eq!(interpolate("${FLOE_TEST_EMPTY:-10}").text, "10");
                assert_eq!(interpolate("${FLOE_TEST_EMPTY-10}").text, "");
            },
        );
    }

    #[test]
    fn test_newline_rejected() {
        with_env_vars(&[("FLOE_TEST_NEWLINE", Some("a\nb"))], || {
            let result = interpolate("$FLOE_TEST_NEWLINE");
            assert!(!result.is_ok());
            assert!(result.errors[0].contains("newlines"));
        });
    }

    #[test]
    fn test_escape_sequence() {
        let result = interpolate("price: $$100");
        assert!(result.is_ok());
        assert_eq!(result.text, "price: $100");
    }
}
