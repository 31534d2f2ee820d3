//! Environment variable substitution over container configurations.
//!
//! Substitution runs on the fully-serialized container after secret
//! injection, with the container's own environment as the namespace, then
//! re-materializes the container. That way later-added variables may
//! reference earlier-added ones regardless of which field they appear in.

use regex::{Captures, Regex};
use std::sync::LazyLock;

use gantry_core::{Container, Error, Result};

static VAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("substitution pattern is valid")
});

/// Expand `${NAME}` references in `template` through `resolve`.
///
/// Unknown names expand to the empty string. Values containing newlines
/// are quoted before reinjection; all values are escaped so the result
/// stays valid inside a JSON document. A `${` left over after expansion is
/// a malformed expression.
pub fn substitute<F>(template: &str, resolve: F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let expanded = VAR_RE.replace_all(template, |caps: &Captures| {
        encode(&resolve(&caps[1]).unwrap_or_default())
    });

    if expanded.contains("${") {
        return Err(Error::InvalidConfiguration(
            "malformed substitution expression".to_string(),
        ));
    }

    Ok(expanded.into_owned())
}

/// JSON-escape a replacement value. Newline-bearing values keep their
/// surrounding quotes; plain values are injected bare.
fn encode(value: &str) -> String {
    let quoted = match serde_json::to_string(value) {
        Ok(quoted) => quoted,
        Err(_) => return value.to_string(),
    };
    if value.contains('\n') {
        quoted
    } else {
        quoted[1..quoted.len() - 1].to_string()
    }
}

/// Substitute a container's serialized form against its own environment
/// and re-materialize it.
pub fn substitute_container(container: &Container) -> Result<Container> {
    let raw = serde_json::to_string(container)
        .map_err(|e| Error::Internal(format!("serialize container {}: {e}", container.id)))?;

    let environment = container.environment.clone();
    let expanded = substitute(&raw, |name| environment.get(name).cloned())?;

    serde_json::from_str(&expanded).map_err(|e| {
        Error::InvalidConfiguration(format!(
            "container {} after substitution: {e}",
            container.id
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn later_variables_reference_earlier_ones() {
        let env = HashMap::from([
            ("A".to_string(), "1".to_string()),
            ("B".to_string(), "${A}${A}".to_string()),
        ]);

        let container = Container {
            id: "step_1_echo".to_string(),
            name: "echo".to_string(),
            number: 1,
            image: "alpine:latest".to_string(),
            environment: env,
            ..Default::default()
        };

        let resolved = substitute_container(&container).unwrap();
        assert_eq!(resolved.environment["B"], "11");
        assert_eq!(resolved.environment["A"], "1");
    }

    #[test]
    fn unknown_references_resolve_to_empty() {
        let out = substitute("echo ${MISSING}!", |_| None).unwrap();
        assert_eq!(out, "echo !");
    }

    #[test]
    fn commands_see_the_environment() {
        let container = Container {
            id: "step_1_echo".to_string(),
            name: "echo".to_string(),
            number: 1,
            image: "alpine:latest".to_string(),
            commands: vec!["echo ${GREETING}".to_string()],
            environment: HashMap::from([("GREETING".to_string(), "hello".to_string())]),
            ..Default::default()
        };

        let resolved = substitute_container(&container).unwrap();
        assert_eq!(resolved.commands, vec!["echo hello"]);
    }

    #[test]
    fn newline_values_are_quoted() {
        let out = substitute("key: ${PEM}", |name| {
            (name == "PEM").then(|| "line1\nline2".to_string())
        })
        .unwrap();
        assert_eq!(out, r#"key: "line1\nline2""#);
    }

    #[test]
    fn quotes_in_values_stay_json_safe() {
        let container = Container {
            id: "step_1_echo".to_string(),
            name: "echo".to_string(),
            number: 1,
            image: "alpine:latest".to_string(),
            commands: vec!["echo ${MSG}".to_string()],
            environment: HashMap::from([("MSG".to_string(), "say \"hi\"".to_string())]),
            ..Default::default()
        };

        let resolved = substitute_container(&container).unwrap();
        assert_eq!(resolved.commands, vec!["echo say \"hi\""]);
    }

    #[test]
    fn unclosed_expression_is_a_configuration_error() {
        let err = substitute("echo ${OOPS", |_| None).unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }
}
