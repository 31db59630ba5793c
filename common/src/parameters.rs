// Step parameter resolution and ${name} placeholder substitution

use crate::errors::SubstitutionError;
use crate::models::StepParameter;
use regex::{Captures, Regex};
use std::collections::HashMap;
use tracing::instrument;

/// ParameterSubstitutor replaces `${name}` placeholders in step text with
/// resolved parameter values.
#[derive(Debug, Clone)]
pub struct ParameterSubstitutor {
    placeholder_regex: Regex,
    values: HashMap<String, String>,
}

impl ParameterSubstitutor {
    /// Resolve the step parameters to text values
    pub fn new(parameters: &[StepParameter]) -> Result<Self, SubstitutionError> {
        let placeholder_regex = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
            .map_err(|e| SubstitutionError::RegexError(e.to_string()))?;
        let name_regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$")
            .map_err(|e| SubstitutionError::RegexError(e.to_string()))?;

        let mut values = HashMap::with_capacity(parameters.len());
        for parameter in parameters {
            if !name_regex.is_match(&parameter.name) {
                return Err(SubstitutionError::InvalidValue {
                    name: parameter.name.clone(),
                    reason: "parameter names must be identifiers".to_string(),
                });
            }
            values.insert(parameter.name.clone(), value_to_text(&parameter.value));
        }

        Ok(Self {
            placeholder_regex,
            values,
        })
    }

    pub fn values(&self) -> &HashMap<String, String> {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Substitute every placeholder in the template.
    ///
    /// All undefined names are reported together.
    #[instrument(
        skip(self, template),
        fields(template_len = template.len(), parameter_count = self.values.len())
    )]
    pub fn substitute(&self, template: &str) -> Result<String, SubstitutionError> {
        let mut undefined = Vec::new();
        for cap in self.placeholder_regex.captures_iter(template) {
            let name = &cap[1];
            if !self.values.contains_key(name) && !undefined.iter().any(|u| u == name) {
                undefined.push(name.to_string());
            }
        }

        if !undefined.is_empty() {
            tracing::error!(
                undefined_parameters = ?undefined,
                "Undefined parameters in step text"
            );
            return Err(SubstitutionError::UndefinedParameter {
                parameters: undefined,
                template: template.to_string(),
            });
        }

        let result = self
            .placeholder_regex
            .replace_all(template, |cap: &Captures| {
                self.values.get(&cap[1]).cloned().unwrap_or_default()
            });
        Ok(result.into_owned())
    }

    /// Substitute an optional template
    pub fn substitute_opt(
        &self,
        template: Option<&str>,
    ) -> Result<Option<String>, SubstitutionError> {
        template.map(|t| self.substitute(t)).transpose()
    }

    /// Placeholder names referenced by the template, without duplicates
    pub fn referenced_names(&self, template: &str) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for cap in self.placeholder_regex.captures_iter(template) {
            if !names.iter().any(|n| n == &cap[1]) {
                names.push(cap[1].to_string());
            }
        }
        names
    }
}

fn value_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}
