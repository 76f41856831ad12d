//! Discovery
//!
//! Finds the attributions to weave. Interceptor attribute types are the
//! types implementing the configured interceptor contract. Discovery runs in
//! two steps:
//!
//! 1. [`Discovery::promote`] copies every type-level interceptor attribute
//!    onto the ordinary methods of its type and removes it from the type.
//! 2. [`Discovery::collect`] scans method-level attributes, skipping
//!    constructors, property accessors and suppressed attributions.
//!
//! `collect` does not touch the program, so running it twice yields the same
//! attributions in the same order.
use std::{hash::Hash, sync::Arc};

use auto_enums::auto_enum;
use loomir::program::{CustomAttribute, MethodDef, MethodId, Modifiers, ProgramUnit, TypeId};

use crate::{
    capability::{CapabilityCache, Capabilities, InterceptorInfo},
    suppression::{SuppressionQuery, SuppressionRules},
    utils::{
        conf::WeaverConfig,
        error::{Phase, WeaveError, WeaveResult},
    },
};

/// Identity of a weaving target: a method together with the continuation
/// method its body was lowered into. Equality and hashing only look at
/// `method`.
#[derive(Debug, Clone, Copy)]
pub struct MethodKey {
    pub method: MethodId,
    pub async_method: Option<MethodId>,
}

impl PartialEq for MethodKey {
    fn eq(&self, other: &Self) -> bool {
        self.method == other.method
    }
}

impl Eq for MethodKey {}

impl Hash for MethodKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.method.hash(state);
    }
}

/// One interceptor attribute applied to a method.
#[derive(Debug, Clone)]
pub struct Attribution {
    pub key: MethodKey,
    /// Position of the attribute in the method's attribute list.
    pub index: usize,
    pub attribute: CustomAttribute,
    pub interceptor: Arc<InterceptorInfo>,
}

impl Attribution {
    pub fn capabilities(&self) -> Capabilities {
        self.interceptor.capabilities
    }
}

/// A type-level attribute copied onto methods.
#[derive(Debug, Clone, PartialEq)]
pub struct Promotion {
    pub ty: TypeId,
    pub attribute: CustomAttribute,
    pub targets: Vec<MethodId>,
    pub suppressed: Vec<MethodId>,
}

pub struct Discovery<'c> {
    config: &'c WeaverConfig,
    rules: &'c SuppressionRules,
    cache: &'c CapabilityCache,
}

impl<'c> Discovery<'c> {
    pub fn new(config: &'c WeaverConfig, rules: &'c SuppressionRules, cache: &'c CapabilityCache) -> Self {
        Self { config, rules, cache }
    }

    /// Types implementing the interceptor contract, in definition order.
    /// Empty when the program does not know the contract at all.
    pub fn interceptor_types(&self, unit: &ProgramUnit) -> Vec<TypeId> {
        if unit.type_by_name(&self.config.interceptor_interface).is_none() {
            log::debug!(
                "`{}` is not referenced by `{}`, nothing to intercept",
                self.config.interceptor_interface,
                unit.name
            );
            return Vec::new();
        }

        unit.types()
            .filter(|(_, def)| !def.kind.is_interface())
            .filter(|(ty, _)| unit.implements(*ty, &self.config.interceptor_interface))
            .map(|(ty, _)| ty)
            .collect()
    }

    fn has_attribute_named(&self, unit: &ProgramUnit, attrs: &[CustomAttribute], names: &[String]) -> bool {
        attrs.iter().any(|attr| {
            unit.type_def(attr.attribute_type)
                .is_some_and(|t| names.contains(&t.full_name))
        })
    }

    fn is_promotion_target(&self, unit: &ProgramUnit, def: &MethodDef, attribute: &CustomAttribute) -> bool {
        !def.kind.is_any_constructor()
            && !def.kind.is_accessor()
            && !def.modifiers.contains(Modifiers::COMPILER_GENERATED)
            && def.body.is_some()
            && !self.has_attribute_named(unit, &def.attributes, &self.config.exclusion_attributes)
            && !def
                .attributes
                .iter()
                .any(|a| a.attribute_type == attribute.attribute_type)
    }

    #[auto_enum(Iterator)]
    fn promotion_targets<'u>(
        &'u self,
        unit: &'u ProgramUnit,
        ty: TypeId,
        attribute: &'u CustomAttribute,
    ) -> impl Iterator<Item = MethodId> + 'u {
        if unit.type_def(ty).is_some_and(|def| def.kind.is_interface() || def.origin.is_external()) {
            std::iter::empty()
        } else {
            unit.methods_of(ty)
                .filter(move |(_, def)| self.is_promotion_target(unit, def, attribute))
                .map(|(id, _)| id)
        }
    }

    /// Copy type-level interceptor attributes onto the methods of their type,
    /// then remove them from the type.
    pub fn promote(&self, unit: &mut ProgramUnit) -> WeaveResult<Vec<Promotion>> {
        let interceptors = self.interceptor_types(unit);
        if interceptors.is_empty() {
            return Ok(Vec::new());
        }

        let mut promotions = Vec::new();
        let mut removals: Vec<(TypeId, usize)> = Vec::new();
        for found in unit.find_types_by_attributes(&interceptors) {
            let def = unit.type_def(found.ty).ok_or(WeaveError::TargetVanished {
                phase: Phase::Promotion,
                method: format!("{:?}", found.ty),
            })?;
            let attribute = def.attributes[found.attribute].clone();

            let mut targets = Vec::new();
            let mut suppressed = Vec::new();
            for method in self.promotion_targets(unit, found.ty, &attribute) {
                let Some(mdef) = unit.method(method) else {
                    continue;
                };
                let query = SuppressionQuery {
                    unit,
                    declaring_type: found.ty,
                    existing: &mdef.attributes,
                    attribution: &attribute,
                    method_name: &mdef.name,
                    type_wide: true,
                };
                if self.rules.is_suppressed(&query) {
                    suppressed.push(method);
                } else {
                    targets.push(method);
                }
            }

            promotions.push(Promotion {
                ty: found.ty,
                attribute,
                targets,
                suppressed,
            });
            removals.push((found.ty, found.attribute));
        }

        for promotion in &promotions {
            for method in &promotion.targets {
                log::debug!(
                    "Promoting type-wide interceptor onto `{}`",
                    unit.method_display(*method)
                );
                if let Some(def) = unit.method_mut(*method) {
                    def.attributes.push(promotion.attribute.clone());
                }
            }
        }

        removals.sort_by(|a, b| b.1.cmp(&a.1));
        for (ty, index) in removals {
            if let Some(def) = unit.type_def_mut(ty) {
                def.attributes.remove(index);
            }
        }

        Ok(promotions)
    }

    /// Method-level attributions, in definition order.
    pub fn collect(&self, unit: &ProgramUnit) -> WeaveResult<Vec<Attribution>> {
        let interceptors = self.interceptor_types(unit);
        if interceptors.is_empty() {
            return Ok(Vec::new());
        }

        let mut attributions = Vec::new();
        for found in unit.find_methods_by_attributes(&interceptors) {
            let def = unit.method(found.method).ok_or(WeaveError::TargetVanished {
                phase: Phase::Discovery,
                method: format!("{:?}", found.method),
            })?;
            if def.kind.is_any_constructor() || def.kind.is_accessor() {
                log::debug!(
                    "Skipping `{}`: constructors and accessors are not interception targets",
                    unit.method_display(found.method)
                );
                continue;
            }

            let attribute = &def.attributes[found.attribute];
            let query = SuppressionQuery {
                unit,
                declaring_type: def.declaring_type,
                existing: &def.attributes,
                attribution: attribute,
                method_name: &def.name,
                type_wide: false,
            };
            if self.rules.is_suppressed(&query) {
                log::debug!(
                    "Interceptor #{} on `{}` is suppressed",
                    found.attribute,
                    unit.method_display(found.method)
                );
                continue;
            }

            let interceptor = self.cache.get(unit, self.config, attribute.attribute_type)?;
            attributions.push(Attribution {
                key: MethodKey {
                    method: found.method,
                    async_method: found.async_method,
                },
                index: found.attribute,
                attribute: attribute.clone(),
                interceptor,
            });
        }
        Ok(attributions)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::tests_utils::{foo_bar, type_wide};

    fn discover(unit: &mut ProgramUnit, config: &WeaverConfig) -> (Vec<Promotion>, Vec<Attribution>) {
        let rules = SuppressionRules::from_config(config);
        let cache = CapabilityCache::new();
        let discovery = Discovery::new(config, &rules, &cache);
        let promotions = discovery.promote(unit).unwrap();
        (promotions, discovery.collect(unit).unwrap())
    }

    #[test]
    fn type_wide_attribute_lands_on_ordinary_methods_only() {
        let mut fx = type_wide();
        let (promotions, attributions) = discover(&mut fx.unit, &WeaverConfig::default());

        assert_eq!(promotions.len(), 1);
        assert_eq!(promotions[0].targets, vec![fx.m1, fx.m2]);
        assert!(fx.unit.type_def(fx.ty).unwrap().attributes.is_empty());
        for untouched in [fx.ctor, fx.getter, fx.ignored] {
            assert!(fx.unit.method(untouched).unwrap().attributes.iter().all(|a| a.attribute_type != fx.a.ty));
        }

        let methods: Vec<_> = attributions.iter().map(|a| a.key.method).collect();
        assert_eq!(methods, vec![fx.m1, fx.m2]);
    }

    #[test]
    fn collection_is_idempotent() {
        let mut fx = foo_bar();
        let config = WeaverConfig::default();
        let rules = SuppressionRules::new();
        let cache = CapabilityCache::new();
        let discovery = Discovery::new(&config, &rules, &cache);
        discovery.promote(&mut fx.unit).unwrap();

        let first = discovery.collect(&fx.unit).unwrap();
        let second = discovery.collect(&fx.unit).unwrap();
        let shape = |v: &[Attribution]| v.iter().map(|a| (a.key.method, a.index)).collect::<Vec<_>>();
        assert_eq!(shape(&first), shape(&second));
        assert_eq!(shape(&first), vec![(fx.bar, 0), (fx.bar, 1)]);
        assert_eq!(first[1].interceptor.full_name, "Demo.B");
    }

    #[test]
    fn method_keys_compare_on_the_method_only() {
        let fx = foo_bar();
        let a = MethodKey {
            method: fx.bar,
            async_method: None,
        };
        let b = MethodKey {
            method: fx.bar,
            async_method: Some(fx.bar),
        };
        assert_eq!(a, b);
        assert_eq!(HashSet::from([a, b]).len(), 1);
    }

    #[test]
    fn missing_contract_means_nothing_to_weave() {
        let mut unit = ProgramUnit::new("plain");
        let (promotions, attributions) = discover(&mut unit, &WeaverConfig::default());
        assert!(promotions.is_empty());
        assert!(attributions.is_empty());
    }
}
