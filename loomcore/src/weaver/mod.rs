//! Weaving orchestrator
//!
//! A [`Weaver`] runs one pass over a program unit:
//!
//! 1. promote type-wide interceptor attributes onto methods,
//! 2. collect the attributions and group them by [`MethodKey`],
//! 3. for every group, ordered by declaring type then method name:
//!    provision the synchronization root when an interceptor needs it, add
//!    one backing field per attribution, rewrite the body, patch the state
//!    machine of asynchronous methods and drop the materialized attributes,
//! 4. check every rewritten body with the stack analysis.
//!
//! Each group walks through [`WeaveState`]; any error aborts the pass.
//!
//! A synchronous target `T::M` ends up as
//!
//! ```text
//! if (f0 == null) { f0 = new A(..); }           // one guard per attribution
//! if (f1 == null) { f1 = new B(..); f1.set_SyncRoot(root); }
//! try {
//!     f0.OnEnter(typeof(T), this, M, args); f1.OnEnter(..);
//!     <original body>
//! } catch (Exception e) {
//!     if (!(f0.OnException(e) || f1.OnException(e))) throw;
//!     return default;
//! } finally {
//!     f0.OnExit(); f1.OnExit();
//! }
//! ```
use std::collections::{HashMap, HashSet};

use loomir::{
    analysis::analyze_method,
    coder::Operand,
    program::{FieldId, MethodId, ProgramUnit, TypeId},
    types::Typeref,
};
use strum::{Display, EnumIs};
use uuid::Uuid;

use crate::{
    capability::CapabilityCache,
    discovery::{Attribution, Discovery, MethodKey, Promotion},
    suppression::{SuppressionRule, SuppressionRules},
    utils::{
        conf::WeaverConfig,
        error::{InPhase, Phase, WeaveError, WeaveResult},
    },
    weaver::provision::{Hook, Provisioner, emit_enter, emit_guards},
    wvdebug, wvinfo,
    wvlog::{LogChannel, LogMessage, PhaseTimer, PhaseTiming},
};

pub mod async_helper;
pub mod provision;

/// Progress of one [`MethodKey`] through a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIs)]
pub enum WeaveState {
    Discovered,
    RootProvisioned,
    FieldsProvisioned,
    BodyWrapped,
    AsyncExceptionPatched,
    Woven,
}

impl WeaveState {
    pub fn can_advance_to(self, next: WeaveState) -> bool {
        use WeaveState::*;
        matches!(
            (self, next),
            (Discovered, RootProvisioned)
                | (Discovered, FieldsProvisioned)
                | (RootProvisioned, FieldsProvisioned)
                | (FieldsProvisioned, BodyWrapped)
                | (BodyWrapped, AsyncExceptionPatched)
                | (BodyWrapped, Woven)
                | (AsyncExceptionPatched, Woven)
        )
    }
}

/// Tracks the state of one key and rejects out of order transitions.
struct KeyProgress {
    method: String,
    state: WeaveState,
}

impl KeyProgress {
    fn advance(&mut self, next: WeaveState, phase: Phase) -> WeaveResult<()> {
        if !self.state.can_advance_to(next) {
            return Err(WeaveError::InvalidTransition {
                phase,
                method: self.method.clone(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        log::trace!("{}: {} -> {}", self.method, self.state, next);
        self.state = next;
        Ok(())
    }
}

/// Outcome of weaving one method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WovenMethod {
    pub method: MethodId,
    pub async_method: Option<MethodId>,
    /// Backing fields, in attribution order.
    pub fields: Vec<FieldId>,
    pub root: Option<FieldId>,
    pub attributes_removed: usize,
}

/// Root field created during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedRoot {
    pub ty: TypeId,
    pub is_static: bool,
    pub field: FieldId,
    pub initializers: Vec<MethodId>,
}

#[derive(Debug, Clone, Default)]
pub struct WeaveReport {
    pub promotions: Vec<Promotion>,
    pub woven: Vec<WovenMethod>,
    pub roots: Vec<ProvisionedRoot>,
    pub timings: Vec<PhaseTiming>,
}

impl WeaveReport {
    pub fn is_empty(&self) -> bool {
        self.woven.is_empty() && self.promotions.is_empty()
    }

    pub fn field_count(&self) -> usize {
        self.woven.iter().map(|w| w.fields.len()).sum()
    }
}

/// State living for one pass only.
#[derive(Default)]
struct WeaveContext {
    cache: CapabilityCache,
    roots: HashMap<(TypeId, bool), FieldId>,
    touched: Vec<MethodId>,
    seen: HashSet<MethodId>,
}

impl WeaveContext {
    fn touch(&mut self, method: MethodId) {
        if self.seen.insert(method) {
            self.touched.push(method);
        }
    }
}

/// One weaving target, resolved right before it is woven.
struct Target {
    key: MethodKey,
    name: String,
    /// Type owning the backing fields and the root.
    ty: TypeId,
    is_static: bool,
    attributions: Vec<Attribution>,
}

pub struct Weaver {
    config: WeaverConfig,
    rules: SuppressionRules,
    log: LogChannel,
}

impl Weaver {
    pub fn new(config: WeaverConfig) -> Self {
        let rules = SuppressionRules::from_config(&config);
        Self {
            config,
            rules,
            log: LogChannel::new(),
        }
    }

    pub fn config(&self) -> &WeaverConfig {
        &self.config
    }

    /// Register a suppression rule for the interceptor type `interceptor`.
    pub fn with_rule(mut self, interceptor: &str, rule: impl SuppressionRule + 'static) -> Self {
        self.rules.register(interceptor, rule);
        self
    }

    /// Receive the progress messages of the following passes.
    pub fn set_log_callback(&self, callback: impl Fn(&LogMessage) + Send + Sync + 'static) {
        self.log.set_callback(callback);
    }

    pub fn log_channel(&self) -> &LogChannel {
        &self.log
    }

    /// Run one pass over `unit`. On error the unit may be partially
    /// rewritten and must be discarded.
    pub fn weave(&self, unit: &mut ProgramUnit) -> WeaveResult<WeaveReport> {
        let mut ctx = WeaveContext::default();
        let mut report = WeaveReport::default();
        let discovery = Discovery::new(&self.config, &self.rules, &ctx.cache);

        let timer = PhaseTimer::start(&self.log, "class wide method");
        report.promotions = discovery.promote(unit)?;
        report.timings.push(timer.finish());

        let attributions = discovery.collect(unit)?;
        if attributions.is_empty() {
            wvdebug!(self.log, "Nothing to weave in `{}`", unit.name);
            if !report.promotions.is_empty() {
                unit.mvid = Uuid::new_v4();
            }
            return Ok(report);
        }
        let groups = Self::group(unit, attributions);

        let timer = PhaseTimer::start(&self.log, "method");
        for (key, attributions) in groups {
            let target = self.resolve(unit, key, attributions)?;
            let woven = self.weave_target(unit, &mut ctx, &mut report, target)?;
            report.woven.push(woven);
        }
        report.timings.push(timer.finish());

        if self.config.verify_output {
            let timer = PhaseTimer::start(&self.log, "verify");
            for method in &ctx.touched {
                analyze_method(unit, *method).in_phase(Phase::Verification, &unit.method_display(*method))?;
            }
            report.timings.push(timer.finish());
        }

        unit.mvid = Uuid::new_v4();
        wvinfo!(
            self.log,
            "Woven {} method(s) of `{}` with {} interceptor field(s)",
            report.woven.len(),
            unit.name,
            report.field_count()
        );
        Ok(report)
    }

    /// Group by key, keeping declared order inside a group, and order the
    /// groups by declaring type name then method name.
    fn group(unit: &ProgramUnit, attributions: Vec<Attribution>) -> Vec<(MethodKey, Vec<Attribution>)> {
        let mut index: HashMap<MethodKey, usize> = HashMap::new();
        let mut groups: Vec<(MethodKey, Vec<Attribution>)> = Vec::new();
        for attribution in attributions {
            match index.get(&attribution.key) {
                Some(at) => groups[*at].1.push(attribution),
                None => {
                    index.insert(attribution.key, groups.len());
                    groups.push((attribution.key, vec![attribution]));
                }
            }
        }

        for (_, group) in groups.iter_mut() {
            group.sort_by_key(|a| a.index);
        }
        groups.sort_by_cached_key(|(key, _)| {
            let def = unit.method(key.method);
            let ty = def
                .and_then(|d| unit.type_def(d.declaring_type))
                .map(|t| t.full_name.clone())
                .unwrap_or_default();
            (ty, def.map(|d| d.name.clone()).unwrap_or_default())
        });
        groups
    }

    fn resolve(&self, unit: &ProgramUnit, key: MethodKey, attributions: Vec<Attribution>) -> WeaveResult<Target> {
        let vanished = || WeaveError::TargetVanished {
            phase: Phase::Discovery,
            method: format!("{:?}", key.method),
        };
        let def = unit.method(key.method).ok_or_else(vanished)?;
        if def.body.is_none() || unit.async_method(key.method) != key.async_method {
            return Err(WeaveError::TargetVanished {
                phase: Phase::Discovery,
                method: unit.method_display(key.method),
            });
        }
        let name = unit.method_display(key.method);
        for attribution in &attributions {
            let still_there = def
                .attributes
                .get(attribution.index)
                .is_some_and(|a| *a == attribution.attribute);
            if !still_there {
                return Err(WeaveError::TargetVanished {
                    phase: Phase::Discovery,
                    method: name,
                });
            }
        }

        Ok(Target {
            key,
            name,
            ty: def.declaring_type,
            is_static: def.is_static(),
            attributions,
        })
    }

    fn progress_line(unit: &ProgramUnit, method: MethodId) -> String {
        let Some(def) = unit.method(method) else {
            return unit.method_display(method);
        };
        let ty = unit.type_def(def.declaring_type).map_or("", |t| t.full_name.as_str());
        let params = def
            .params
            .iter()
            .map(|p| unit.registry.fmt(p.ty).to_string())
            .collect::<Vec<_>>()
            .join(", ");
        format!("{} {}({})", ty, def.name, params)
    }

    fn weave_target(
        &self,
        unit: &mut ProgramUnit,
        ctx: &mut WeaveContext,
        report: &mut WeaveReport,
        target: Target,
    ) -> WeaveResult<WovenMethod> {
        wvinfo!(
            self.log,
            "Implementing method interceptors: {}",
            Self::progress_line(unit, target.key.method)
        );
        let mut progress = KeyProgress {
            method: target.name.clone(),
            state: WeaveState::Discovered,
        };
        let provisioner = Provisioner::new(&self.config);

        // Synchronization root, shared by every attribution of the type.
        let needs_root = target.attributions.iter().any(|a| a.interceptor.needs_root());
        let root = if needs_root {
            let slot = (target.ty, target.is_static);
            let field = match ctx.roots.get(&slot) {
                Some(field) => *field,
                None => {
                    let (field, initializers) = provisioner.provision_root(unit, target.ty, target.is_static)?;
                    wvdebug!(
                        self.log,
                        "Synchronization root `{}` patched into {} initializer(s)",
                        unit.field(field).map_or("", |f| f.name.as_str()),
                        initializers.len()
                    );
                    for init in &initializers {
                        ctx.touch(*init);
                    }
                    ctx.roots.insert(slot, field);
                    report.roots.push(ProvisionedRoot {
                        ty: target.ty,
                        is_static: target.is_static,
                        field,
                        initializers,
                    });
                    field
                }
            };
            progress.advance(WeaveState::RootProvisioned, Phase::RootProvisioning)?;
            Some(field)
        } else {
            None
        };

        let mut hooks: Vec<Hook> = Vec::with_capacity(target.attributions.len());
        for attribution in &target.attributions {
            hooks.push(provisioner.provision_field(
                unit,
                target.ty,
                target.key.method,
                target.is_static,
                attribution,
                root,
            )?);
        }
        progress.advance(WeaveState::FieldsProvisioned, Phase::FieldProvisioning)?;

        let root_ref = root
            .map(|root| unit.field_ref(root, None))
            .transpose()
            .in_phase(Phase::BodyWrapping, &target.name)?;
        let declaring = unit
            .self_instance(target.ty)
            .in_phase(Phase::BodyWrapping, &target.name)?;

        match target.key.async_method {
            None => self.wrap_body(unit, &target, &hooks, root_ref, declaring)?,
            Some(_) => self.wrap_entry(unit, &target, &hooks, root_ref, declaring)?,
        }
        ctx.touch(target.key.method);
        progress.advance(WeaveState::BodyWrapped, Phase::BodyWrapping)?;

        if let Some(move_next) = target.key.async_method {
            let hop = if target.is_static {
                None
            } else {
                Some(async_helper::this_hop(unit, &self.config, target.key.method, move_next)?)
            };
            async_helper::patch_fault_path(unit, move_next, &hooks, hop)?;
            let completions = async_helper::patch_completions(unit, &self.config, move_next, &hooks, hop)?;
            wvdebug!(
                self.log,
                "Patched the continuation `{}`: {} completion call(s)",
                unit.method_display(move_next),
                completions
            );
            ctx.touch(move_next);
            progress.advance(WeaveState::AsyncExceptionPatched, Phase::AsyncPatching)?;
        }

        let removed = self.remove_attributes(unit, &target)?;
        progress.advance(WeaveState::Woven, Phase::AttributeRemoval)?;

        Ok(WovenMethod {
            method: target.key.method,
            async_method: target.key.async_method,
            fields: hooks.iter().map(|h| h.field).collect(),
            root,
            attributes_removed: removed,
        })
    }

    fn catch_type(&self, unit: &ProgramUnit, target: &Target) -> WeaveResult<Typeref> {
        let ty = unit
            .type_by_name(&self.config.exception_type)
            .ok_or_else(|| WeaveError::UnresolvedCatchType {
                phase: Phase::BodyWrapping,
                name: self.config.exception_type.clone(),
                method: target.name.clone(),
            })?;
        unit.type_ref(ty).in_phase(Phase::BodyWrapping, &target.name)
    }

    /// Replace the body of a synchronous target with the guarded
    /// try/catch/finally construction around its original code.
    fn wrap_body(
        &self,
        unit: &mut ProgramUnit,
        target: &Target,
        hooks: &[Hook],
        root: Option<loomir::program::FieldRef>,
        declaring: Typeref,
    ) -> WeaveResult<()> {
        let exception_type = self.catch_type(unit, target)?;
        let Some((first, rest)) = hooks.split_first() else {
            return Ok(());
        };
        let method = target.key.method;
        let is_static = target.is_static;

        unit.with_coder(method, |c| {
            emit_guards(c, hooks, root)?;
            c.try_(|c| {
                emit_enter(c, hooks, declaring, method, is_static)?;
                c.original_body()?;
                Ok(())
            })?
            .catch(exception_type, |c| {
                let mut handled = c.condition().call(
                    Some(first.receiver(None)),
                    first.on_exception.clone(),
                    &[Operand::Exception],
                )?;
                for hook in rest {
                    handled = handled.or_else(|c| {
                        c.push_call(Some(hook.receiver(None)), hook.on_exception.clone(), &[Operand::Exception])
                            .map(|_| ())
                    })?;
                }
                handled.is_false()?.then(|c| c.rethrow())?.end_if()?;
                c.return_default()?;
                Ok(())
            })?
            .finally(|c| {
                for hook in hooks {
                    c.call(Some(hook.receiver(None)), hook.on_exit.clone(), &[])?;
                }
                Ok(())
            })?
            .end_try()?;
            c.return_()?;
            c.replace()
        })
        .in_phase(Phase::BodyWrapping, &target.name)
    }

    /// Prepend the guards and `OnEnter` calls to the entry method of an
    /// asynchronous target.
    fn wrap_entry(
        &self,
        unit: &mut ProgramUnit,
        target: &Target,
        hooks: &[Hook],
        root: Option<loomir::program::FieldRef>,
        declaring: Typeref,
    ) -> WeaveResult<()> {
        // The state machine's handler catches this type; make sure it exists
        // before touching anything.
        self.catch_type(unit, target)?;
        let method = target.key.method;
        let is_static = target.is_static;
        unit.with_coder(method, |c| {
            emit_guards(c, hooks, root)?;
            emit_enter(c, hooks, declaring, method, is_static)?;
            c.insert(loomir::coder::InsertionPosition::Beginning)
        })
        .in_phase(Phase::BodyWrapping, &target.name)
    }

    /// Drop the attributes materialized into code, highest index first.
    fn remove_attributes(&self, unit: &mut ProgramUnit, target: &Target) -> WeaveResult<usize> {
        let mut indices: Vec<usize> = target.attributions.iter().map(|a| a.index).collect();
        indices.sort_unstable_by(|a, b| b.cmp(a));
        indices.dedup();

        let def = unit
            .method_mut(target.key.method)
            .ok_or_else(|| WeaveError::TargetVanished {
                phase: Phase::AttributeRemoval,
                method: target.name.clone(),
            })?;
        for index in &indices {
            if *index >= def.attributes.len() {
                return Err(WeaveError::TargetVanished {
                    phase: Phase::AttributeRemoval,
                    method: target.name.clone(),
                });
            }
            def.attributes.remove(*index);
        }
        Ok(indices.len())
    }
}

impl Default for Weaver {
    fn default() -> Self {
        Self::new(WeaverConfig::default())
    }
}
