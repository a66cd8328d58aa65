//! Rule engine: the ordered, read-only rule set for one run

use std::collections::HashSet;

use crate::config::Config;
use crate::error::{LabelerError, Result};
use crate::models::Rule;

#[derive(Debug, Clone, Default)]
pub struct RuleEngine {
    rules: Vec<Rule>,
}

impl RuleEngine {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Build rules from a validated configuration, keeping file order
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut rules = Vec::with_capacity(config.rules.len());

        for (index, rule) in config.rules.iter().enumerate() {
            let id = rule.effective_id(index);
            let query = rule.composed_query().ok_or_else(|| {
                LabelerError::ConfigError(format!("rule '{}' has no query", id))
            })?;

            rules.push(Rule {
                id,
                query,
                label_name: rule.label.trim().to_string(),
                enabled: rule.enabled,
            });
        }

        Ok(Self { rules })
    }

    /// Every configured rule, enabled or not
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Rules to evaluate in this run, in configuration order
    ///
    /// With an empty selection every enabled rule is due. Naming a rule
    /// selects it even if it is disabled; naming an unknown rule is a
    /// configuration error.
    pub fn due_rules(&self, selection: &[String]) -> Result<Vec<Rule>> {
        if selection.is_empty() {
            return Ok(self.rules.iter().filter(|r| r.enabled).cloned().collect());
        }

        let wanted: HashSet<&str> = selection.iter().map(String::as_str).collect();
        let known: HashSet<&str> = self.rules.iter().map(|r| r.id.as_str()).collect();

        let mut unknown: Vec<&str> = wanted.difference(&known).copied().collect();
        if !unknown.is_empty() {
            unknown.sort_unstable();
            return Err(LabelerError::ConfigError(format!(
                "unknown rule id(s): {}",
                unknown.join(", ")
            )));
        }

        Ok(self
            .rules
            .iter()
            .filter(|r| wanted.contains(r.id.as_str()))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuleConfig;

    fn config() -> Config {
        Config {
            rules: vec![
                RuleConfig {
                    id: Some("notify".to_string()),
                    query: Some("from:notify@x.com".to_string()),
                    label: " X ".to_string(),
                    enabled: true,
                    ..RuleConfig::default()
                },
                RuleConfig {
                    any: vec!["subject:invoice".to_string(), "subject:receipt".to_string()],
                    label: "Finance".to_string(),
                    enabled: false,
                    ..RuleConfig::default()
                },
                RuleConfig {
                    id: Some("news".to_string()),
                    query: Some("list:news.example.com".to_string()),
                    label: "News".to_string(),
                    enabled: true,
                    ..RuleConfig::default()
                },
            ],
            ..Config::default()
        }
    }

    #[test]
    fn test_from_config_preserves_order_and_queries() {
        let engine = RuleEngine::from_config(&config()).unwrap();
        let ids: Vec<&str> = engine.rules().iter().map(|r| r.id.as_str()).collect();

        assert_eq!(ids, vec!["notify", "rule-2", "news"]);
        assert_eq!(engine.rules()[0].query, "from:notify@x.com");
        assert_eq!(engine.rules()[0].label_name, "X");
        assert_eq!(
            engine.rules()[1].query,
            "{(subject:invoice) (subject:receipt)}"
        );
    }

    #[test]
    fn test_due_rules_skips_disabled() {
        let engine = RuleEngine::from_config(&config()).unwrap();
        let due = engine.due_rules(&[]).unwrap();
        let ids: Vec<&str> = due.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["notify", "news"]);
    }

    #[test]
    fn test_due_rules_selection_keeps_config_order() {
        let engine = RuleEngine::from_config(&config()).unwrap();
        let due = engine
            .due_rules(&["news".to_string(), "rule-2".to_string()])
            .unwrap();
        let ids: Vec<&str> = due.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["rule-2", "news"]);
    }

    #[test]
    fn test_due_rules_unknown_selection() {
        let engine = RuleEngine::from_config(&config()).unwrap();
        let err = engine.due_rules(&["missing".to_string()]).unwrap_err();
        assert!(matches!(err, LabelerError::ConfigError(_)));
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_empty_engine() {
        let engine = RuleEngine::default();
        assert!(engine.due_rules(&[]).unwrap().is_empty());
    }
}
