//! Method bodies
//!
//! A [`MethodBody`] stores its instructions in an arena keyed by [`InstrId`]
//! and keeps their execution order in a separate vector. Jump targets and
//! exception region bounds are handles into the arena, so inserting code
//! never shifts them, and removing an instruction re-targets every reference
//! to its successor.
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};
use strum::EnumIs;

use crate::{types::Typeref, utils::Error};

pub use instr::{Flow, Instr, InstrOp, Token};

pub mod instr;

new_key_type! {
    /// Stable handle of an instruction inside a [`MethodBody`].
    pub struct InstrId;
}

/// Index of a local variable slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LocalId(pub u16);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Local {
    pub ty: Typeref,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIs)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum HandlerKind {
    /// Entered with the exception object on the stack when it is an instance
    /// of the given type.
    Catch(Typeref),
    Finally,
    Fault,
}

/// One exception region. Bounds are exclusive at the end; a `handler_end`
/// of `None` means the handler runs up to the end of the body.
///
/// Handlers are listed innermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ExceptionHandler {
    pub kind: HandlerKind,
    pub try_start: InstrId,
    pub try_end: InstrId,
    pub handler_start: InstrId,
    pub handler_end: Option<InstrId>,
}

/// Exception region bounds resolved to positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionSpan {
    pub kind: HandlerKind,
    pub try_range: (usize, usize),
    pub handler_range: (usize, usize),
}

impl RegionSpan {
    pub fn in_try(&self, at: usize) -> bool {
        self.try_range.0 <= at && at < self.try_range.1
    }

    pub fn in_handler(&self, at: usize) -> bool {
        self.handler_range.0 <= at && at < self.handler_range.1
    }
}

#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MethodBody {
    pub locals: Vec<Local>,
    arena: SlotMap<InstrId, Instr>,
    order: Vec<InstrId>,
    pub handlers: Vec<ExceptionHandler>,
}

impl MethodBody {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a body from a list of instructions, returning their handles in
    /// order.
    pub fn from_instrs(instrs: impl IntoIterator<Item = Instr>) -> (Self, Vec<InstrId>) {
        let mut body = Self::new();
        let ids = instrs.into_iter().map(|i| body.push(i)).collect();
        (body, ids)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, id: InstrId) -> Option<&Instr> {
        self.arena.get(id)
    }

    pub fn get_mut(&mut self, id: InstrId) -> Option<&mut Instr> {
        self.arena.get_mut(id)
    }

    /// Linked instructions in execution order.
    pub fn iter(&self) -> impl Iterator<Item = (InstrId, &Instr)> + '_ {
        self.order.iter().map(move |id| (*id, &self.arena[*id]))
    }

    pub fn ids(&self) -> &[InstrId] {
        &self.order
    }

    pub fn first(&self) -> Option<InstrId> {
        self.order.first().copied()
    }

    pub fn position(&self, id: InstrId) -> Option<usize> {
        self.order.iter().position(|i| *i == id)
    }

    pub fn is_linked(&self, id: InstrId) -> bool {
        self.position(id).is_some()
    }

    /// Append an instruction to the stream.
    pub fn push(&mut self, instr: Instr) -> InstrId {
        let id = self.arena.insert(instr);
        self.order.push(id);
        id
    }

    /// Store an instruction without linking it. Used for forward labels.
    pub fn alloc(&mut self, instr: Instr) -> InstrId {
        self.arena.insert(instr)
    }

    pub fn insert_at(&mut self, index: usize, instr: Instr) -> InstrId {
        let id = self.arena.insert(instr);
        self.order.insert(index.min(self.order.len()), id);
        id
    }

    pub fn insert_before(&mut self, anchor: InstrId, instr: Instr) -> Result<InstrId, Error> {
        let index = self.position(anchor).ok_or(Error::UnlinkedInstruction)?;
        Ok(self.insert_at(index, instr))
    }

    pub fn insert_after(&mut self, anchor: InstrId, instr: Instr) -> Result<InstrId, Error> {
        let index = self.position(anchor).ok_or(Error::UnlinkedInstruction)?;
        Ok(self.insert_at(index + 1, instr))
    }

    /// Link already allocated instructions at `index`.
    pub(crate) fn splice_at(&mut self, index: usize, ids: &[InstrId]) -> Result<(), Error> {
        if ids.iter().any(|id| self.is_linked(*id)) {
            return Err(Error::AlreadyLinked);
        }
        let index = index.min(self.order.len());
        self.order.splice(index..index, ids.iter().copied());
        Ok(())
    }

    /// Swap the linked stream for `order`. Handlers are left to the caller.
    pub(crate) fn set_order(&mut self, order: Vec<InstrId>) {
        self.order = order;
    }

    /// Drop instructions that are no longer linked.
    pub(crate) fn retain_linked(&mut self) {
        let linked: std::collections::HashSet<InstrId> = self.order.iter().copied().collect();
        self.arena.retain(|id, _| linked.contains(&id));
    }

    /// Unlink the current stream and hand it over, leaving the body empty.
    pub(crate) fn take_order(&mut self) -> Vec<InstrId> {
        std::mem::take(&mut self.order)
    }

    /// Overwrite the instruction behind `id`, keeping the handle so every
    /// jump to it stays valid. Returns the previous instruction.
    pub fn replace(&mut self, id: InstrId, instr: Instr) -> Result<Instr, Error> {
        let slot = self.arena.get_mut(id).ok_or(Error::UnlinkedInstruction)?;
        Ok(std::mem::replace(slot, instr))
    }

    /// Instructions jumping to `target`.
    pub fn jump_sources(&self, target: InstrId) -> Vec<InstrId> {
        self.iter()
            .filter(|(_, instr)| instr.target() == Some(target))
            .map(|(id, _)| id)
            .collect()
    }

    /// Unlink and drop an instruction. Jumps and region bounds referring to
    /// it move to the next instruction.
    pub fn remove(&mut self, id: InstrId) -> Result<Instr, Error> {
        let index = self.position(id).ok_or(Error::UnlinkedInstruction)?;
        let successor = self.order.get(index + 1).copied();

        let referenced_by_jump = !self.jump_sources(id).is_empty();
        let referenced_by_region = self.handlers.iter().any(|h| {
            h.try_start == id || h.try_end == id || h.handler_start == id
        });

        let new_target = match successor {
            Some(next) => next,
            None if referenced_by_jump || referenced_by_region => {
                return Err(Error::DanglingTarget { at: index });
            }
            None => {
                for handler in &mut self.handlers {
                    if handler.handler_end == Some(id) {
                        handler.handler_end = None;
                    }
                }
                self.order.remove(index);
                return self.arena.remove(id).ok_or(Error::UnlinkedInstruction);
            }
        };

        log::trace!("Removing instruction at position {}", index);
        for (_, instr) in self.arena.iter_mut() {
            if let Some(target) = instr.target_mut()
                && *target == id
            {
                *target = new_target;
            }
        }
        for handler in &mut self.handlers {
            for bound in [
                &mut handler.try_start,
                &mut handler.try_end,
                &mut handler.handler_start,
            ] {
                if *bound == id {
                    *bound = new_target;
                }
            }
            if handler.handler_end == Some(id) {
                handler.handler_end = Some(new_target);
            }
        }

        self.order.remove(index);
        self.arena.remove(id).ok_or(Error::UnlinkedInstruction)
    }

    pub fn declare_local(&mut self, ty: Typeref, name: Option<String>) -> LocalId {
        let id = LocalId(self.locals.len() as u16);
        self.locals.push(Local { ty, name });
        id
    }

    /// Resolve the bounds of every exception region to positions.
    pub fn region_spans(&self) -> Result<Vec<RegionSpan>, Error> {
        self.handlers
            .iter()
            .enumerate()
            .map(|(index, h)| {
                let pos = |id: InstrId| self.position(id).ok_or(Error::MalformedRegion { index });
                let try_start = pos(h.try_start)?;
                let try_end = pos(h.try_end)?;
                let handler_start = pos(h.handler_start)?;
                let handler_end = match h.handler_end {
                    Some(end) => pos(end)?,
                    None => self.order.len(),
                };
                if !(try_start < try_end && try_end <= handler_start && handler_start < handler_end) {
                    return Err(Error::MalformedRegion { index });
                }
                Ok(RegionSpan {
                    kind: h.kind,
                    try_range: (try_start, try_end),
                    handler_range: (handler_start, handler_end),
                })
            })
            .collect()
    }

    /// Check structural consistency: every jump target is linked, every
    /// local exists and every region is well ordered.
    pub fn validate(&self, method: &str) -> Result<(), Error> {
        for (at, (_, instr)) in self.iter().enumerate() {
            if let Some(target) = instr.target()
                && !self.is_linked(target)
            {
                return Err(Error::UnlinkedTarget { at });
            }

            let local = match instr {
                Instr::LdLoc(l) | Instr::StLoc(l) | Instr::LdLocA(l) => Some(*l),
                _ => None,
            };
            if let Some(local) = local
                && usize::from(local.0) >= self.locals.len()
            {
                return Err(Error::UndeclaredLocal {
                    method: method.to_string(),
                    local: local.0,
                });
            }
        }

        self.region_spans().map(|_| ())
    }
}
