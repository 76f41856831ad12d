//! Suppression rules
//!
//! A rule is registered for one interceptor attribute type and decides, per
//! attribution, whether that interceptor must be left out. Interceptor types
//! without any registered rule are never suppressed and never reach a rule.
use std::collections::HashMap;

use loomir::program::{CustomAttribute, ProgramUnit, TypeId};

use crate::utils::conf::WeaverConfig;

/// What a rule gets to see about one attribution.
pub struct SuppressionQuery<'a> {
    pub unit: &'a ProgramUnit,
    pub declaring_type: TypeId,
    /// Attributes already present on the target method.
    pub existing: &'a [CustomAttribute],
    pub attribution: &'a CustomAttribute,
    pub method_name: &'a str,
    /// Set while a type-level attribute is being promoted onto methods.
    pub type_wide: bool,
}

pub trait SuppressionRule {
    fn is_suppressed(&self, query: &SuppressionQuery<'_>) -> bool;
}

impl<F> SuppressionRule for F
where
    F: Fn(&SuppressionQuery<'_>) -> bool,
{
    fn is_suppressed(&self, query: &SuppressionQuery<'_>) -> bool {
        self(query)
    }
}

/// Suppresses an interceptor on methods (or, while promoting, types)
/// carrying an attribute of the given type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeSuppression {
    pub when: String,
}

impl SuppressionRule for AttributeSuppression {
    fn is_suppressed(&self, query: &SuppressionQuery<'_>) -> bool {
        let named = |attr: &CustomAttribute| {
            query
                .unit
                .type_def(attr.attribute_type)
                .is_some_and(|t| t.full_name == self.when)
        };
        if query.existing.iter().any(named) {
            return true;
        }
        query.type_wide
            && query
                .unit
                .type_def(query.declaring_type)
                .is_some_and(|t| t.attributes.iter().any(named))
    }
}

/// Rules by interceptor attribute full name.
#[derive(Default)]
pub struct SuppressionRules {
    rules: HashMap<String, Vec<Box<dyn SuppressionRule>>>,
}

impl SuppressionRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// The [`AttributeSuppression`] rules listed in the configuration.
    pub fn from_config(config: &WeaverConfig) -> Self {
        let mut rules = Self::new();
        for entry in &config.suppress {
            rules.register(
                &entry.interceptor,
                AttributeSuppression {
                    when: entry.when.clone(),
                },
            );
        }
        rules
    }

    pub fn register(&mut self, interceptor: &str, rule: impl SuppressionRule + 'static) {
        self.rules
            .entry(interceptor.to_string())
            .or_default()
            .push(Box::new(rule));
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn is_suppressed(&self, query: &SuppressionQuery<'_>) -> bool {
        let Some(interceptor) = query.unit.type_def(query.attribution.attribute_type) else {
            return false;
        };
        let Some(rules) = self.rules.get(&interceptor.full_name) else {
            return false;
        };
        rules.iter().any(|rule| rule.is_suppressed(query))
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use super::*;
    use crate::{tests_utils::foo_bar, utils::conf::SuppressEntry};

    #[test]
    fn lookup_without_rules_for_the_interceptor_is_not_suppressed() {
        let fx = foo_bar();
        let def = fx.unit.method(fx.bar).unwrap();
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let mut rules = SuppressionRules::new();
        rules.register("Demo.Other", move |_: &SuppressionQuery<'_>| {
            counter.set(counter.get() + 1);
            true
        });

        let query = SuppressionQuery {
            unit: &fx.unit,
            declaring_type: fx.foo,
            existing: &def.attributes,
            attribution: &def.attributes[0],
            method_name: &def.name,
            type_wide: false,
        };
        assert!(!rules.is_suppressed(&query));
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn configured_attribute_rule_matches_existing_attributes() {
        let fx = foo_bar();
        let def = fx.unit.method(fx.bar).unwrap();
        let config = WeaverConfig {
            suppress: vec![SuppressEntry {
                interceptor: "Demo.A".into(),
                when: "Demo.B".into(),
            }],
            ..WeaverConfig::default()
        };
        let rules = SuppressionRules::from_config(&config);

        let query = |attribution| SuppressionQuery {
            unit: &fx.unit,
            declaring_type: fx.foo,
            existing: &def.attributes,
            attribution,
            method_name: &def.name,
            type_wide: false,
        };
        // `Bar` carries both A and B: A is suppressed by the presence of B,
        // B has no rule.
        assert!(rules.is_suppressed(&query(&def.attributes[0])));
        assert!(!rules.is_suppressed(&query(&def.attributes[1])));
    }
}
