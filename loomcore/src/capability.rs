//! Capability detection
//!
//! What an interceptor type can do is decided structurally, by looking up the
//! contracts it implements, and what it wants injected by scanning its
//! fields for the assign-to-field attribute. Both are computed once per type
//! and kept in a [`CapabilityCache`] for the rest of the pass.
use std::{collections::HashMap, str::FromStr, sync::Arc};

use bitflags::bitflags;
use loomir::program::{AttributeArg, FieldId, ProgramUnit, TypeId};
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use strum::{Display, EnumIs, EnumString};

use crate::utils::{
    conf::WeaverConfig,
    error::{Phase, WeaveError, WeaveResult},
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u8 {
        /// Implements `OnEnter`, `OnException` and `OnExit`.
        const METHOD_INTERCEPTOR = 1 << 0;
        /// Needs the synchronization root through its setter.
        const SYNC_ROOT = 1 << 1;
    }
}

/// Value the weaver stores into an interceptor field right after
/// construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIs, EnumString, Display)]
pub enum InjectedValue {
    SyncRoot,
    DeclaringType,
    MethodName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldBinding {
    pub field: FieldId,
    pub value: InjectedValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptorInfo {
    pub ty: TypeId,
    pub full_name: String,
    pub capabilities: Capabilities,
    pub bindings: Vec<FieldBinding>,
}

impl InterceptorInfo {
    /// Whether weaving this interceptor requires the shared root field.
    pub fn needs_root(&self) -> bool {
        self.capabilities.contains(Capabilities::SYNC_ROOT) || self.bindings.iter().any(|b| b.value.is_sync_root())
    }

    fn compute(unit: &ProgramUnit, config: &WeaverConfig, ty: TypeId) -> WeaveResult<Self> {
        let full_name = unit
            .type_def(ty)
            .map(|def| def.full_name.clone())
            .unwrap_or_default();

        let mut capabilities = Capabilities::empty();
        if unit.implements(ty, &config.interceptor_interface) {
            capabilities |= Capabilities::METHOD_INTERCEPTOR;
        }
        if unit.implements(ty, &config.sync_root_interface) {
            capabilities |= Capabilities::SYNC_ROOT;
        }

        let mut bindings = Vec::new();
        for (field, def) in unit.fields_of(ty) {
            let tagged = def.attributes.iter().find(|attr| {
                unit.type_def(attr.attribute_type)
                    .is_some_and(|t| t.full_name == config.assign_field_attribute)
            });
            let Some(attr) = tagged else {
                continue;
            };

            let requested = match attr.args.first() {
                Some(AttributeArg::Str(s)) => s.clone(),
                other => format!("{:?}", other),
            };
            let value = InjectedValue::from_str(&requested).map_err(|_| WeaveError::InvalidBinding {
                phase: Phase::Discovery,
                ty: full_name.clone(),
                field: def.name.clone(),
                value: requested.clone(),
            })?;
            bindings.push(FieldBinding { field, value });
        }

        Ok(Self {
            ty,
            full_name,
            capabilities,
            bindings,
        })
    }
}

/// Pass-scoped cache of [`InterceptorInfo`] by interceptor type.
#[derive(Debug, Default)]
pub struct CapabilityCache {
    entries: RwLock<HashMap<TypeId, Arc<InterceptorInfo>>>,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, unit: &ProgramUnit, config: &WeaverConfig, ty: TypeId) -> WeaveResult<Arc<InterceptorInfo>> {
        let entries = self.entries.upgradable_read();
        if let Some(info) = entries.get(&ty) {
            return Ok(info.clone());
        }

        let info = Arc::new(InterceptorInfo::compute(unit, config, ty)?);
        log::debug!(
            "Capabilities of `{}`: {:?}, {} binding(s)",
            info.full_name,
            info.capabilities,
            info.bindings.len()
        );
        let mut entries = RwLockUpgradableReadGuard::upgrade(entries);
        entries.insert(ty, info.clone());
        Ok(info)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop every entry; used between independent passes.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_utils::{foo_bar, interceptor_with_binding};

    #[test]
    fn capabilities_follow_implemented_contracts() {
        let fx = foo_bar();
        let config = WeaverConfig::default();
        let cache = CapabilityCache::new();

        let a = cache.get(&fx.unit, &config, fx.a.ty).unwrap();
        let b = cache.get(&fx.unit, &config, fx.b.ty).unwrap();
        assert_eq!(a.capabilities, Capabilities::METHOD_INTERCEPTOR);
        assert!(!a.needs_root());
        assert!(b.capabilities.contains(Capabilities::METHOD_INTERCEPTOR | Capabilities::SYNC_ROOT));
        assert!(b.needs_root());

        let again = cache.get(&fx.unit, &config, fx.a.ty).unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(cache.len(), 2);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn assign_to_field_bindings_are_discovered() {
        let mut fx = foo_bar();
        let (info_ty, field) = interceptor_with_binding(&mut fx.unit, &fx.fw, "Demo.Named", "MethodName");
        let info = CapabilityCache::new()
            .get(&fx.unit, &WeaverConfig::default(), info_ty)
            .unwrap();
        assert_eq!(
            info.bindings,
            vec![FieldBinding {
                field,
                value: InjectedValue::MethodName,
            }]
        );
        assert!(!info.needs_root());

        let (bad, _) = interceptor_with_binding(&mut fx.unit, &fx.fw, "Demo.Broken", "Nonsense");
        let err = CapabilityCache::new()
            .get(&fx.unit, &WeaverConfig::default(), bad)
            .unwrap_err();
        assert!(matches!(err, WeaveError::InvalidBinding { ref value, .. } if value == "Nonsense"));
    }
}
