//! Spec validator: structural checks, default resolution, and cycle
//! detection, run before any resource is allocated (spec §4.2).
//!
//! Produces the full *set* of errors rather than the first one, so the
//! caller can decide whether to surface all of them at once.

mod cycle;

use rig_common::levenshtein::closest_match;
use rig_domain::{Environment, KNOWN_SERVICE_TYPES};

/// One structural problem found in a submitted spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub service: Option<String>,
    pub message: String,
}

impl ValidationError {
    fn global(message: impl Into<String>) -> Self {
        Self {
            service: None,
            message: message.into(),
        }
    }

    fn on(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            service: Some(service.into()),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.service {
            Some(s) => write!(f, "{s}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Validates `env` in place (mutating egress default resolution per rule 4)
/// and returns every error found. An empty return means the spec is
/// accepted (B2: errors are returned sorted by service name then rule).
pub fn validate(env: &mut Environment) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    // Rule 1: name non-empty, at least one service.
    if env.name.trim().is_empty() {
        errors.push(ValidationError::global("environment name must not be empty"));
    }
    if env.services.is_empty() {
        errors.push(ValidationError::global("environment must declare at least one service"));
    }

    let service_names: Vec<String> = env.services.keys().cloned().collect();

    // Rule 2: recognised service type.
    for name in &service_names {
        let service_type = env.services[name].service_type.clone();
        if !KNOWN_SERVICE_TYPES.contains(&service_type.as_str()) {
            let suggestion = closest_match(&service_type, KNOWN_SERVICE_TYPES.iter().copied())
                .map(|s| format!(" (did you mean {s:?}?)"))
                .unwrap_or_default();
            errors.push(ValidationError::on(
                name,
                format!("unrecognised service type {service_type:?}{suggestion}"),
            ));
        }
    }

    // Rule 3: ingress protocol validity is enforced at decode time by the
    // `Protocol` enum; nothing else to check here.

    // Rule 4 + default resolution: egress target/ingress resolution.
    for name in &service_names {
        let egress_names: Vec<String> = env.services[name].egresses.keys().cloned().collect();
        for egress_name in &egress_names {
            let target_name = env.services[name].egresses[egress_name].service.clone();

            if target_name == *name {
                errors.push(ValidationError::on(
                    name,
                    format!("egress {egress_name:?} targets itself"),
                ));
                continue;
            }

            let Some(target) = env.services.get(&target_name) else {
                let suggestion = closest_match(&target_name, service_names.iter().map(String::as_str))
                    .map(|s| format!(" (did you mean {s:?}?)"))
                    .unwrap_or_default();
                errors.push(ValidationError::on(
                    name,
                    format!("egress {egress_name:?} targets unknown service {target_name:?}{suggestion}"),
                ));
                continue;
            };

            if target.ingresses.is_empty() {
                errors.push(ValidationError::on(
                    name,
                    format!("egress {egress_name:?} targets {target_name:?}, which has no ingresses"),
                ));
                continue;
            }

            let explicit_ingress = env.services[name].egresses[egress_name].ingress.clone();
            let resolved = match explicit_ingress {
                Some(ingress_name) => {
                    if !target.ingresses.contains_key(&ingress_name) {
                        let suggestion =
                            closest_match(&ingress_name, target.ingresses.keys().map(String::as_str))
                                .map(|s| format!(" (did you mean {s:?}?)"))
                                .unwrap_or_default();
                        errors.push(ValidationError::on(
                            name,
                            format!(
                                "egress {egress_name:?} targets unknown ingress {ingress_name:?} on {target_name:?}{suggestion}"
                            ),
                        ));
                        None
                    } else {
                        Some(ingress_name)
                    }
                }
                None => {
                    if target.ingresses.len() == 1 {
                        target.ingresses.keys().next().cloned()
                    } else if target.ingresses.contains_key("default") {
                        Some("default".to_string())
                    } else {
                        errors.push(ValidationError::on(
                            name,
                            format!(
                                "egress {egress_name:?} on {target_name:?} is ambiguous: target has multiple ingresses and none named \"default\""
                            ),
                        ));
                        None
                    }
                }
            };

            if let Some(resolved) = resolved {
                env.services
                    .get_mut(name)
                    .unwrap()
                    .egresses
                    .get_mut(egress_name)
                    .unwrap()
                    .ingress = Some(resolved);
            }
        }
    }

    // Rule 5: cycle detection over the (now default-resolved) egress graph.
    if let Some(cycle_error) = cycle::detect_cycle(env) {
        errors.push(cycle_error);
    }

    errors.sort_by(|a, b| {
        a.service
            .clone()
            .unwrap_or_default()
            .cmp(&b.service.clone().unwrap_or_default())
            .then_with(|| a.message.cmp(&b.message))
    });
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use rig_domain::Environment;

    fn parse(raw: &str) -> Environment {
        Environment::from_json(raw).unwrap()
    }

    #[test]
    fn happy_path_two_services_has_no_errors() {
        let mut env = parse(
            r#"{"name":"t","services":{
                "db":{"type":"postgres"},
                "app":{"type":"go","egresses":{"database":{"service":"db"}}}
            }}"#,
        );
        assert!(validate(&mut env).is_empty());
    }

    #[test]
    fn empty_name_and_no_services_are_both_reported() {
        let mut env = parse(r#"{"name":"","services":{}}"#);
        let errors = validate(&mut env);
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn unrecognised_type_gets_did_you_mean() {
        let mut env = parse(r#"{"name":"t","services":{"a":{"type":"postgre"}}}"#);
        let errors = validate(&mut env);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("postgres"));
    }

    #[test]
    fn self_egress_is_rejected() {
        let mut env = parse(
            r#"{"name":"t","services":{"a":{"type":"process","egresses":{"e":{"service":"a"}}}}}"#,
        );
        let errors = validate(&mut env);
        assert!(errors.iter().any(|e| e.message.contains("targets itself")));
    }

    #[test]
    fn ambiguous_egress_without_default_is_rejected() {
        let mut env = parse(
            r#"{"name":"t","services":{
                "db":{"type":"postgres","ingresses":{"a":{"protocol":"tcp"},"b":{"protocol":"tcp"}}},
                "app":{"type":"go","egresses":{"e":{"service":"db"}}}
            }}"#,
        );
        let errors = validate(&mut env);
        assert!(errors.iter().any(|e| e.message.contains("ambiguous")));
    }

    #[test]
    fn single_ingress_default_resolves_silently() {
        let mut env = parse(
            r#"{"name":"t","services":{
                "db":{"type":"postgres","ingresses":{"sql":{"protocol":"tcp"}}},
                "app":{"type":"go","egresses":{"e":{"service":"db"}}}
            }}"#,
        );
        assert!(validate(&mut env).is_empty());
        assert_eq!(
            env.services["app"].egresses["e"].ingress,
            Some("sql".to_string())
        );
    }

    #[test]
    fn cycle_is_reported_with_full_path() {
        let mut env = parse(
            r#"{"name":"t","services":{
                "a":{"type":"http","egresses":{"e":{"service":"b"}}},
                "b":{"type":"http","egresses":{"e":{"service":"c"}}},
                "c":{"type":"http","egresses":{"e":{"service":"a"}}}
            }}"#,
        );
        let errors = validate(&mut env);
        let cycle_error = errors
            .iter()
            .find(|e| e.message.to_lowercase().contains("cycle"))
            .expect("expected a cycle error");
        assert!(cycle_error.message.contains("a -> b -> c -> a"));
    }

    #[test]
    fn validation_errors_are_deterministically_sorted() {
        let mut env = parse(
            r#"{"name":"t","services":{
                "z":{"type":"nope"},
                "a":{"type":"nope"}
            }}"#,
        );
        let errors = validate(&mut env);
        let services: Vec<_> = errors.iter().map(|e| e.service.clone().unwrap()).collect();
        let mut sorted = services.clone();
        sorted.sort();
        assert_eq!(services, sorted);
    }
}
