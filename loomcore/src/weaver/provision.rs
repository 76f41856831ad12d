//! Synchronization roots and interceptor backing fields.
use loomir::{
    body::Instr,
    coder::{Coder, CoderError, InsertionPosition, Operand},
    program::{AttributeArg, FieldDef, FieldId, FieldRef, MethodId, MethodKind, MethodRef, Modifiers, ProgramUnit, TypeId},
    types::Typeref,
};

use crate::{
    capability::{Capabilities, InjectedValue},
    discovery::Attribution,
    magic,
    utils::{
        conf::WeaverConfig,
        error::{InPhase, Phase, WeaveError, WeaveResult},
    },
};

/// One interceptor materialized on a target: its backing field and the
/// references the generated code calls.
#[derive(Debug, Clone)]
pub struct Hook {
    pub field: FieldId,
    field_ref: FieldRef,
    ctor: MethodRef,
    args: Vec<Operand>,
    named: Vec<(FieldRef, Operand)>,
    sync_setter: Option<MethodRef>,
    bindings: Vec<(FieldRef, Operand)>,
    pub on_enter: MethodRef,
    pub on_exception: MethodRef,
    pub on_exit: MethodRef,
}

impl Hook {
    /// The interceptor instance, read directly or, from a state machine,
    /// through the field holding the original instance.
    pub fn receiver(&self, hop: Option<FieldRef>) -> Operand {
        match hop {
            Some(hop) => Operand::FieldOf(Box::new(Operand::Field(hop)), self.field_ref),
            None => Operand::Field(self.field_ref),
        }
    }
}

fn constant(arg: &AttributeArg) -> Operand {
    match arg {
        AttributeArg::Null => Operand::Null,
        AttributeArg::Bool(b) => Operand::Bool(*b),
        AttributeArg::I32(v) => Operand::I32(*v),
        AttributeArg::I64(v) => Operand::I64(*v),
        AttributeArg::Str(s) => Operand::Str(s.clone()),
        AttributeArg::Type(t) => Operand::TypeOf(*t),
    }
}

/// Emit the lazy construction of every hook:
/// `if (field == null) { field = new I(args); field.X = ..; field.set_SyncRoot(root); }`.
pub fn emit_guards(c: &mut Coder<'_>, hooks: &[Hook], root: Option<FieldRef>) -> Result<(), CoderError> {
    for hook in hooks {
        let this = hook.receiver(None);
        c.is_null(this.clone())?
            .then(|c| {
                c.assign(this.clone()).new_obj(hook.ctor.clone(), &hook.args)?;
                for (field, value) in &hook.named {
                    c.assign(Operand::FieldOf(Box::new(this.clone()), *field))
                        .value(value.clone())?;
                }
                if let (Some(setter), Some(root)) = (&hook.sync_setter, root) {
                    c.call(Some(this.clone()), setter.clone(), &[Operand::Field(root)])?;
                }
                for (field, value) in &hook.bindings {
                    c.assign(Operand::FieldOf(Box::new(this.clone()), *field))
                        .value(value.clone())?;
                }
                Ok(())
            })?
            .end_if()?;
    }
    Ok(())
}

/// Emit `OnEnter(declaringType, instance, method, args)` on every hook.
pub fn emit_enter(c: &mut Coder<'_>, hooks: &[Hook], ty: Typeref, method: MethodId, is_static: bool) -> Result<(), CoderError> {
    let instance = if is_static { Operand::Null } else { Operand::This };
    let args = [
        Operand::TypeOf(ty),
        instance,
        Operand::MethodOf(method),
        Operand::Arguments,
    ];
    for hook in hooks {
        c.call(Some(hook.receiver(None)), hook.on_enter.clone(), &args)?;
    }
    Ok(())
}

pub struct Provisioner<'c> {
    config: &'c WeaverConfig,
}

impl<'c> Provisioner<'c> {
    pub fn new(config: &'c WeaverConfig) -> Self {
        Self { config }
    }

    fn object_ctor(&self, unit: &ProgramUnit) -> WeaveResult<MethodRef> {
        let object = unit
            .type_by_name(&self.config.object_type)
            .ok_or_else(|| WeaveError::MissingFrameworkType {
                phase: Phase::RootProvisioning,
                name: self.config.object_type.clone(),
            })?;
        let ctor = unit
            .constructors(object)
            .into_iter()
            .find(|ctor| unit.method(*ctor).is_some_and(|def| def.params.is_empty()))
            .ok_or_else(|| WeaveError::MissingConstructor {
                phase: Phase::RootProvisioning,
                ty: self.config.object_type.clone(),
                what: "parameterless",
            })?;
        unit.method_ref(ctor, None)
            .in_phase(Phase::RootProvisioning, &self.config.object_type)
    }

    /// Whether `ctor` hands construction over to another constructor of its
    /// own type. Such a constructor reaches the root assignment through the
    /// constructor it calls.
    fn delegates(unit: &ProgramUnit, ty: TypeId, ctor: MethodId) -> bool {
        let Some(body) = unit.method(ctor).and_then(|def| def.body.as_ref()) else {
            return false;
        };
        body.iter().any(|(_, instr)| match instr {
            Instr::Call(target) => unit
                .method(target.method)
                .is_some_and(|def| def.kind == MethodKind::Constructor && def.declaring_type == ty && target.method != ctor),
            _ => false,
        })
    }

    /// Initializers receiving the root assignment: the type initializer for
    /// a static root, every non delegating constructor otherwise.
    fn root_initializers(&self, unit: &mut ProgramUnit, ty: TypeId, is_static: bool) -> WeaveResult<Vec<MethodId>> {
        let type_name = unit.type_def(ty).map(|t| t.full_name.clone()).unwrap_or_default();
        if is_static {
            let cctor = unit
                .get_or_create_static_constructor(ty)
                .in_phase(Phase::RootProvisioning, &type_name)?;
            return Ok(vec![cctor]);
        }

        let ctors: Vec<_> = unit
            .constructors(ty)
            .into_iter()
            .filter(|ctor| !Self::delegates(unit, ty, *ctor))
            .collect();
        if ctors.is_empty() {
            return Err(WeaveError::MissingConstructor {
                phase: Phase::RootProvisioning,
                ty: type_name,
                what: "instance",
            });
        }
        Ok(ctors)
    }

    /// Add the root field of `ty` and assign it a fresh lock object at the
    /// beginning of its initializers. Returns the field and the initializers
    /// that were patched.
    pub fn provision_root(
        &self,
        unit: &mut ProgramUnit,
        ty: TypeId,
        is_static: bool,
    ) -> WeaveResult<(FieldId, Vec<MethodId>)> {
        let type_name = unit.type_def(ty).map(|t| t.full_name.clone()).unwrap_or_default();
        let object_ctor = self.object_ctor(unit)?;
        let object = object_ctor.declaring;

        let name = if is_static {
            magic::STATIC_ROOT_FIELD
        } else {
            magic::INSTANCE_ROOT_FIELD
        };
        let field = unit
            .add_field(ty, FieldDef::new(name, object, Modifiers::synthetic_field(is_static)))
            .in_phase(Phase::RootProvisioning, &type_name)?;
        let root = unit
            .field_ref(field, None)
            .in_phase(Phase::RootProvisioning, &type_name)?;

        let initializers = self.root_initializers(unit, ty, is_static)?;
        for init in &initializers {
            let target = unit.method_display(*init);
            unit.with_coder(*init, |c| {
                c.assign(Operand::Field(root)).new_obj(object_ctor.clone(), &[])?;
                c.insert(InsertionPosition::Beginning)
            })
            .in_phase(Phase::RootProvisioning, &target)?;
        }
        Ok((field, initializers))
    }

    fn field_name(unit: &ProgramUnit, ty: TypeId, method: MethodId, index: usize) -> String {
        let ordinal = unit
            .type_def(ty)
            .and_then(|def| def.methods.iter().position(|m| *m == method))
            .unwrap_or_default();
        let method_name = unit.method(method).map_or("", |def| def.name.as_str());
        let base = format!("<{}>_attrib{}_m{}", method_name, index, ordinal);
        if unit.field_by_name(ty, &base).is_none() {
            return base;
        }
        (1..)
            .map(|n| format!("{}_{}", base, n))
            .find(|name| unit.field_by_name(ty, name).is_none())
            .unwrap_or(base)
    }

    /// Hook method `name` of the interceptor `ty`, possibly inherited. The
    /// reference goes through the base as instantiated by `ty`.
    fn member(&self, unit: &ProgramUnit, ty: TypeId, name: &str, params: usize, owner: &str) -> WeaveResult<MethodRef> {
        let method = unit
            .find_method_in_hierarchy(ty, name, params)
            .ok_or_else(|| WeaveError::MissingMember {
                phase: Phase::FieldProvisioning,
                ty: owner.to_string(),
                member: name.to_string(),
                params,
            })?;
        let instance = unit.self_instance(ty).in_phase(Phase::FieldProvisioning, owner)?;
        unit.method_ref(method, Some(instance))
            .in_phase(Phase::FieldProvisioning, owner)
    }

    /// Add the backing field of `attribution` on `ty` and resolve everything
    /// its generated code needs.
    pub fn provision_field(
        &self,
        unit: &mut ProgramUnit,
        ty: TypeId,
        method: MethodId,
        is_static: bool,
        attribution: &Attribution,
        root: Option<FieldId>,
    ) -> WeaveResult<Hook> {
        let info = &attribution.interceptor;
        let owner = info.full_name.as_str();
        let target = unit.method_display(method);

        let field_type = unit.type_ref(info.ty).in_phase(Phase::FieldProvisioning, owner)?;
        let name = Self::field_name(unit, ty, method, attribution.index);
        let field = unit
            .add_field(ty, FieldDef::new(name, field_type, Modifiers::synthetic_field(is_static)))
            .in_phase(Phase::FieldProvisioning, &target)?;
        let field_ref = unit.field_ref(field, None).in_phase(Phase::FieldProvisioning, &target)?;

        let ctor = unit
            .method_ref(attribution.attribute.constructor, None)
            .in_phase(Phase::FieldProvisioning, owner)?;
        let interceptor = unit.self_instance(info.ty).in_phase(Phase::FieldProvisioning, owner)?;
        let args = attribution.attribute.args.iter().map(constant).collect();
        let named = attribution
            .attribute
            .named
            .iter()
            .map(|n| Ok((unit.field_ref(n.field, Some(interceptor))?, constant(&n.value))))
            .collect::<Result<Vec<_>, loomir::utils::Error>>()
            .in_phase(Phase::FieldProvisioning, owner)?;

        let sync_setter = if info.capabilities.contains(Capabilities::SYNC_ROOT) {
            Some(self.member(unit, info.ty, &self.config.sync_root_setter, 1, owner)?)
        } else {
            None
        };

        let root_ref = root
            .map(|root| unit.field_ref(root, None))
            .transpose()
            .in_phase(Phase::FieldProvisioning, &target)?;
        let declaring = unit.self_instance(ty).in_phase(Phase::FieldProvisioning, &target)?;
        let method_name = unit.method(method).map(|def| def.name.clone()).unwrap_or_default();
        let mut bindings = Vec::with_capacity(info.bindings.len());
        for binding in &info.bindings {
            let value = match binding.value {
                InjectedValue::SyncRoot => Operand::Field(root_ref.ok_or_else(|| WeaveError::InvalidBinding {
                    phase: Phase::FieldProvisioning,
                    ty: owner.to_string(),
                    field: unit.field(binding.field).map(|f| f.name.clone()).unwrap_or_default(),
                    value: binding.value.to_string(),
                })?),
                InjectedValue::DeclaringType => Operand::TypeOf(declaring),
                InjectedValue::MethodName => Operand::Str(method_name.clone()),
            };
            let field = unit
                .field_ref(binding.field, Some(interceptor))
                .in_phase(Phase::FieldProvisioning, owner)?;
            bindings.push((field, value));
        }

        Ok(Hook {
            field,
            field_ref,
            ctor,
            args,
            named,
            sync_setter,
            bindings,
            on_enter: self.member(unit, info.ty, &self.config.on_enter, 4, owner)?,
            on_exception: self.member(unit, info.ty, &self.config.on_exception, 1, owner)?,
            on_exit: self.member(unit, info.ty, &self.config.on_exit, 0, owner)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use loomir::{analysis::analyze_method, body::Instr};

    use super::*;
    use crate::{
        tests_utils::{counter, derived_interceptor, foo_bar},
        weaver::Weaver,
    };

    #[test]
    fn instance_root_skips_delegating_constructors() {
        let mut fx = counter();
        let config = WeaverConfig::default();
        let (root, patched) = Provisioner::new(&config)
            .provision_root(&mut fx.unit, fx.ty, false)
            .unwrap();

        assert_eq!(patched, vec![fx.ctor_value]);
        let field = fx.unit.field(root).unwrap();
        assert_eq!(field.name, magic::INSTANCE_ROOT_FIELD);
        assert!(field.modifiers.contains(Modifiers::PRIVATE | Modifiers::NOT_SERIALIZED));

        let body = fx.unit.method(fx.ctor_value).unwrap().body.as_ref().unwrap();
        let first: Vec<_> = body.iter().take(3).map(|(_, i)| i.clone()).collect();
        assert!(matches!(first.as_slice(), [Instr::LdArg(0), Instr::NewObj(_), Instr::StFld(f)] if f.field == root));
        analyze_method(&fx.unit, fx.ctor_value).unwrap();
    }

    #[test]
    fn static_root_creates_the_type_initializer() {
        let mut fx = foo_bar();
        assert!(fx.unit.static_constructor(fx.foo).is_none());
        let (root, patched) = Provisioner::new(&WeaverConfig::default())
            .provision_root(&mut fx.unit, fx.foo, true)
            .unwrap();

        assert_eq!(patched.len(), 1);
        assert_eq!(fx.unit.static_constructor(fx.foo), Some(patched[0]));
        assert!(fx.unit.field(root).unwrap().is_static());
        analyze_method(&fx.unit, patched[0]).unwrap();
    }

    #[test]
    fn inherited_hooks_are_called_through_the_closed_base() {
        let mut fx = foo_bar();
        let (derived, base) = derived_interceptor(&mut fx.unit, &fx.fw, "Demo.Derived", Typeref::I32);
        fx.unit.method_mut(fx.bar).unwrap().attributes = vec![derived.attribute()];
        Weaver::default().weave(&mut fx.unit).unwrap();

        let closed = fx.unit.registry.instance(fx.unit.type_ref(base).unwrap(), [Typeref::I32]);
        let body = fx.unit.method(fx.bar).unwrap().body.as_ref().unwrap();
        let declaring: Vec<_> = body
            .iter()
            .filter_map(|(_, instr)| match instr {
                Instr::CallVirt(m) if fx.unit.method(m.method).is_some_and(|d| d.declaring_type == base) => {
                    Some(m.declaring)
                }
                _ => None,
            })
            .collect();
        assert_eq!(declaring, vec![closed; 3]);
        assert_ne!(closed, fx.unit.self_instance(base).unwrap());
        analyze_method(&fx.unit, fx.bar).unwrap();
    }

    #[test]
    fn backing_field_names_avoid_collisions() {
        let mut fx = foo_bar();
        let ordinal = fx.unit.type_def(fx.foo).unwrap().methods.iter().position(|m| *m == fx.bar).unwrap();
        let taken = format!("<Bar>_attrib0_m{}", ordinal);
        fx.unit
            .add_field(fx.foo, FieldDef::new(taken.clone(), Typeref::I32, Modifiers::PRIVATE))
            .unwrap();

        assert_eq!(
            Provisioner::field_name(&fx.unit, fx.foo, fx.bar, 0),
            format!("{}_1", taken)
        );
        assert_eq!(
            Provisioner::field_name(&fx.unit, fx.foo, fx.bar, 1),
            format!("<Bar>_attrib1_m{}", ordinal)
        );
    }

    #[test]
    fn missing_object_type_is_reported() {
        let mut fx = foo_bar();
        let config = WeaverConfig {
            object_type: "Nope.Object".into(),
            ..WeaverConfig::default()
        };
        let err = Provisioner::new(&config)
            .provision_root(&mut fx.unit, fx.foo, true)
            .unwrap_err();
        assert!(matches!(err, WeaveError::MissingFrameworkType { ref name, .. } if name == "Nope.Object"));
    }
}
