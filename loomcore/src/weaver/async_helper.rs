//! Weaving of continuation-lowered (asynchronous) methods.
//!
//! The entry method only creates and starts the state machine, so it gets
//! the guards and the `OnEnter` calls. The state machine's `MoveNext`
//! already owns a catch handler storing the fault into the task builder:
//! right after that handler stores the exception, the `OnException` chain
//! decides whether to leave the handler as a successful completion. `OnExit`
//! runs before every builder completion call.
use loomir::{
    body::{HandlerKind, Instr, InstrId, LocalId},
    coder::{InsertionPosition, Operand},
    program::{FieldRef, MethodId, ProgramUnit},
};

use crate::{
    utils::{
        conf::WeaverConfig,
        error::{InPhase, Phase, WeaveError, WeaveResult},
    },
    weaver::provision::Hook,
};

/// Where the exception chain goes in a `MoveNext` body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultSite {
    /// `stloc` storing the caught exception.
    pub store: InstrId,
    pub exception: LocalId,
    /// First instruction after the handler: the successful completion path.
    pub handler_end: InstrId,
}

fn shape_error(unit: &ProgramUnit, method: MethodId, reason: &str) -> WeaveError {
    WeaveError::StateMachineShape {
        phase: Phase::AsyncPatching,
        method: unit.method_display(method),
        reason: reason.to_string(),
    }
}

/// Locate the terminal catch handler of `move_next` and its exception store.
pub fn find_fault_site(unit: &ProgramUnit, move_next: MethodId) -> WeaveResult<FaultSite> {
    let body = unit
        .method(move_next)
        .and_then(|def| def.body.as_ref())
        .ok_or_else(|| shape_error(unit, move_next, "the continuation has no body"))?;

    let handler = body
        .handlers
        .iter()
        .rev()
        .find(|h| matches!(h.kind, HandlerKind::Catch(_)))
        .ok_or_else(|| shape_error(unit, move_next, "no catch handler"))?;
    let handler_end = handler
        .handler_end
        .ok_or_else(|| shape_error(unit, move_next, "the catch handler runs to the end of the body"))?;
    let start = body
        .position(handler.handler_start)
        .ok_or_else(|| shape_error(unit, move_next, "the catch handler start is not linked"))?;

    body.iter()
        .skip(start)
        .find_map(|(id, instr)| match instr {
            Instr::StLoc(local) => Some(FaultSite {
                store: id,
                exception: *local,
                handler_end,
            }),
            _ => None,
        })
        .ok_or_else(|| shape_error(unit, move_next, "the catch handler does not store the exception"))
}

/// Calls to the configured completion methods, in body order.
pub fn completion_calls(unit: &ProgramUnit, config: &WeaverConfig, move_next: MethodId) -> Vec<InstrId> {
    let Some(body) = unit.method(move_next).and_then(|def| def.body.as_ref()) else {
        return Vec::new();
    };
    body.iter()
        .filter_map(|(id, instr)| match instr {
            Instr::Call(target) | Instr::CallVirt(target) => unit
                .method(target.method)
                .filter(|def| config.completion_methods.contains(&def.name))
                .map(|_| id),
            _ => None,
        })
        .collect()
}

/// Field of the state machine holding the instance of an instance method.
pub fn this_hop(unit: &ProgramUnit, config: &WeaverConfig, method: MethodId, move_next: MethodId) -> WeaveResult<FieldRef> {
    let machine = unit
        .method(move_next)
        .map(|def| def.declaring_type)
        .ok_or_else(|| shape_error(unit, method, "the continuation vanished"))?;
    let field = unit
        .field_by_name(machine, &config.state_machine_this_field)
        .ok_or_else(|| shape_error(unit, method, "the state machine does not capture the instance"))?;
    unit.field_ref(field, None)
        .in_phase(Phase::AsyncPatching, &unit.method_display(move_next))
}

/// Insert the `OnException` chain after the exception store of `move_next`.
/// Every interceptor is asked (bitwise or); when one of them handled the
/// exception, control leaves the handler to the completion path.
pub fn patch_fault_path(
    unit: &mut ProgramUnit,
    move_next: MethodId,
    hooks: &[Hook],
    hop: Option<FieldRef>,
) -> WeaveResult<FaultSite> {
    let site = find_fault_site(unit, move_next)?;
    let Some((first, rest)) = hooks.split_first() else {
        return Ok(site);
    };

    let target = unit.method_display(move_next);
    let exception = [Operand::Local(site.exception)];
    unit.with_coder(move_next, |c| {
        let mut expr = c
            .condition()
            .call(Some(first.receiver(hop)), first.on_exception.clone(), &exception)?;
        for hook in rest {
            expr = expr.or(|c| {
                c.push_call(Some(hook.receiver(hop)), hook.on_exception.clone(), &exception)
                    .map(|_| ())
            })?;
        }
        expr.is_true()?
            .then(|c| {
                c.leave(site.handler_end);
                Ok(())
            })?
            .end_if()?;
        c.insert(InsertionPosition::After(site.store))
    })
    .in_phase(Phase::AsyncPatching, &target)?;
    Ok(site)
}

/// Insert the `OnExit` calls before every completion call of `move_next`.
pub fn patch_completions(
    unit: &mut ProgramUnit,
    config: &WeaverConfig,
    move_next: MethodId,
    hooks: &[Hook],
    hop: Option<FieldRef>,
) -> WeaveResult<usize> {
    let calls = completion_calls(unit, config, move_next);
    if calls.is_empty() {
        return Err(shape_error(unit, move_next, "no builder completion call"));
    }

    let target = unit.method_display(move_next);
    for call in &calls {
        unit.with_coder(move_next, |c| {
            for hook in hooks {
                c.call(Some(hook.receiver(hop)), hook.on_exit.clone(), &[])?;
            }
            c.insert(InsertionPosition::Before(*call))
        })
        .in_phase(Phase::AsyncPatching, &target)?;
    }
    Ok(calls.len())
}
