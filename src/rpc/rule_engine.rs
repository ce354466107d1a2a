//! Ordered regex rules mapping header observations to a value list.
//!
//! A rule matches a list of inputs when it has one pattern per input and
//! every pattern matches its input. The first matching rule wins.

use regex::Regex;

use crate::config::RuleConfig;

#[derive(Debug, Clone)]
struct Rule {
    patterns: Vec<Regex>,
    value: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RuleEngine {
    rules: Vec<Rule>,
}

impl RuleEngine {
    pub fn new(rules: &[RuleConfig]) -> Result<Self, regex::Error> {
        let rules = rules
            .iter()
            .map(|rule| {
                let patterns = rule
                    .patterns
                    .iter()
                    .map(|p| Regex::new(p))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Rule {
                    patterns,
                    value: rule.value.clone(),
                })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Value of the first rule matching `inputs`.
    pub fn get_value(&self, inputs: &[&str]) -> Option<&[String]> {
        self.rules
            .iter()
            .find(|rule| {
                rule.patterns.len() == inputs.len()
                    && rule
                        .patterns
                        .iter()
                        .zip(inputs)
                        .all(|(pattern, input)| pattern.is_match(input))
            })
            .map(|rule| rule.value.as_slice())
    }
}
