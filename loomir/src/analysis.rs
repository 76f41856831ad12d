//! Stack balance analysis.
//!
//! Builds the control flow graph of a body and propagates evaluation stack
//! depths along it. A body passes when every instruction is reached with a
//! single depth, no instruction pops more than is available, every `ret`
//! sits outside protected regions and leaves exactly the return value, and
//! no path runs past the last instruction.
use petgraph::{
    Direction,
    graph::{DiGraph, NodeIndex},
    visit::EdgeRef,
};
use strum::EnumIs;

use crate::{
    body::{Flow, HandlerKind, MethodBody},
    program::{MethodDef, MethodId, ProgramUnit},
    utils::Error,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIs)]
pub enum EdgeKind {
    FallThrough,
    Jump,
    /// `leave` edge; the stack is empty at the target.
    Leave,
    /// From the start of a protected region to its handler.
    Exceptional,
}

/// Control flow graph over instruction positions.
pub struct ControlFlowGraph {
    pub graph: DiGraph<usize, EdgeKind>,
    nodes: Vec<NodeIndex>,
}

impl ControlFlowGraph {
    pub fn build(body: &MethodBody) -> Result<Self, Error> {
        let mut graph = DiGraph::with_capacity(body.len(), body.len() + 4);
        let nodes: Vec<_> = (0..body.len()).map(|i| graph.add_node(i)).collect();

        for (at, (_, instr)) in body.iter().enumerate() {
            let target = |id| body.position(id).ok_or(Error::UnlinkedTarget { at });
            match instr.flow() {
                Flow::Next => {
                    if at + 1 < nodes.len() {
                        graph.add_edge(nodes[at], nodes[at + 1], EdgeKind::FallThrough);
                    }
                }
                Flow::Jump(t) => {
                    graph.add_edge(nodes[at], nodes[target(t)?], EdgeKind::Jump);
                }
                Flow::Branch(t) => {
                    graph.add_edge(nodes[at], nodes[target(t)?], EdgeKind::Jump);
                    if at + 1 < nodes.len() {
                        graph.add_edge(nodes[at], nodes[at + 1], EdgeKind::FallThrough);
                    }
                }
                Flow::Leave(t) => {
                    graph.add_edge(nodes[at], nodes[target(t)?], EdgeKind::Leave);
                }
                Flow::Return | Flow::Stop => {}
            }
        }

        for span in body.region_spans()? {
            graph.add_edge(
                nodes[span.try_range.0],
                nodes[span.handler_range.0],
                EdgeKind::Exceptional,
            );
        }

        Ok(Self { graph, nodes })
    }

    /// Normal successors of the instruction at `at`.
    pub fn successors(&self, at: usize) -> impl Iterator<Item = (usize, EdgeKind)> + '_ {
        self.graph
            .edges_directed(self.nodes[at], Direction::Outgoing)
            .filter(|e| !e.weight().is_exceptional())
            .map(|e| (self.graph[e.target()], *e.weight()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackInfo {
    pub max_stack: u16,
    /// Number of instructions reachable from the entry or a handler.
    pub reachable: usize,
}

/// Run the stack analysis on the body of `method`.
pub fn analyze_method(unit: &ProgramUnit, method: MethodId) -> Result<StackInfo, Error> {
    let def = unit.method(method).ok_or(Error::InvalidHandle { kind: "method" })?;
    let name = unit.method_display(method);
    let body = def.body.as_ref().ok_or_else(|| Error::MissingBody {
        method: name.clone(),
    })?;
    analyze_body(unit, def, body, &name)
}

pub fn analyze_body(unit: &ProgramUnit, def: &MethodDef, body: &MethodBody, name: &str) -> Result<StackInfo, Error> {
    if body.is_empty() {
        return Err(Error::EmptyBody {
            method: name.to_string(),
        });
    }
    body.validate(name)?;

    let spans = body.region_spans()?;
    let cfg = ControlFlowGraph::build(body)?;
    let instrs: Vec<_> = body.iter().map(|(_, i)| i).collect();

    let mut depths: Vec<Option<u16>> = vec![None; instrs.len()];
    let mut worklist = vec![0usize];
    depths[0] = Some(0);
    for span in &spans {
        let entry = match span.kind {
            HandlerKind::Catch(_) => 1,
            HandlerKind::Finally | HandlerKind::Fault => 0,
        };
        depths[span.handler_range.0] = Some(entry);
        worklist.push(span.handler_range.0);
    }

    let mut max_stack = 0u16;
    let mut visited = vec![false; instrs.len()];
    while let Some(at) = worklist.pop() {
        if std::mem::replace(&mut visited[at], true) {
            continue;
        }
        let depth = depths[at].unwrap_or(0);
        let instr = instrs[at];
        let (pop, push) = instr.stack_effect(unit, def)?;

        if depth < pop {
            return Err(Error::StackUnderflow {
                method: name.to_string(),
                at,
            });
        }
        let after = depth - pop + push;
        max_stack = max_stack.max(depth).max(after);

        match instr.flow() {
            Flow::Return => {
                if spans.iter().any(|s| s.in_try(at) || s.in_handler(at)) {
                    return Err(Error::ReturnInProtectedRegion {
                        method: name.to_string(),
                        at,
                    });
                }
                if depth != pop {
                    return Err(Error::StackImbalanceAtReturn {
                        method: name.to_string(),
                        at,
                        depth,
                    });
                }
            }
            Flow::Next | Flow::Branch(_) if at + 1 == instrs.len() => {
                return Err(Error::FallOffEnd {
                    method: name.to_string(),
                    at,
                });
            }
            _ => {}
        }

        for (next, kind) in cfg.successors(at) {
            let incoming = if kind.is_leave() { 0 } else { after };
            match depths[next] {
                None => {
                    depths[next] = Some(incoming);
                    worklist.push(next);
                }
                Some(existing) if existing != incoming => {
                    return Err(Error::InconsistentStack {
                        method: name.to_string(),
                        at: next,
                        expected: existing,
                        found: incoming,
                    });
                }
                Some(_) => {}
            }
        }
    }

    Ok(StackInfo {
        max_stack,
        reachable: visited.iter().filter(|v| **v).count(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        body::{ExceptionHandler, Instr},
        program::{TypeDef, TypeKind},
        types::Typeref,
    };

    fn unit_with(body: MethodBody, ret: Typeref) -> (ProgramUnit, MethodId) {
        let mut unit = ProgramUnit::new("test");
        let ty = unit.add_type(TypeDef::new("T", TypeKind::Class)).unwrap();
        let m = unit
            .add_method(ty, MethodDef::ordinary("M", ret).with_body(body))
            .unwrap();
        (unit, m)
    }

    #[test]
    fn balanced_body_reports_max_stack() {
        let (body, _) = MethodBody::from_instrs([
            Instr::LdcI4(1),
            Instr::LdcI4(2),
            Instr::Add,
            Instr::Ret,
        ]);
        let (unit, m) = unit_with(body, Typeref::I32);
        let info = analyze_method(&unit, m).unwrap();
        assert_eq!(info.max_stack, 2);
        assert_eq!(info.reachable, 4);
    }

    #[test]
    fn return_with_leftovers_is_rejected() {
        let (body, _) = MethodBody::from_instrs([Instr::LdcI4(1), Instr::Ret]);
        let (unit, m) = unit_with(body, Typeref::VOID);
        assert!(analyze_method(&unit, m).unwrap_err().is_stack_imbalance_at_return());
    }

    #[test]
    fn falling_off_the_end_is_rejected() {
        let (body, _) = MethodBody::from_instrs([Instr::Nop]);
        let (unit, m) = unit_with(body, Typeref::VOID);
        assert!(analyze_method(&unit, m).unwrap_err().is_fall_off_end());
    }

    #[test]
    fn joins_must_agree_on_depth() {
        let mut body = MethodBody::new();
        let join = body.alloc(Instr::Pop);
        body.push(Instr::LdcI4(0));
        body.push(Instr::BrTrue(join));
        body.push(Instr::LdcI4(1));
        body.splice_at(3, &[join]).unwrap();
        body.push(Instr::Ret);
        let (unit, m) = unit_with(body, Typeref::VOID);
        assert!(analyze_method(&unit, m).unwrap_err().is_inconsistent_stack());
    }

    #[test]
    fn ret_inside_try_is_rejected_and_leave_is_accepted() {
        let mut body = MethodBody::new();
        let end = body.alloc(Instr::Ret);
        let try_start = body.push(Instr::Nop);
        let leave = body.push(Instr::Leave(end));
        let fin = body.push(Instr::EndFinally);
        body.splice_at(3, &[end]).unwrap();
        body.handlers.push(ExceptionHandler {
            kind: HandlerKind::Finally,
            try_start,
            try_end: fin,
            handler_start: fin,
            handler_end: Some(end),
        });
        let (mut unit, m) = unit_with(body, Typeref::VOID);
        analyze_method(&unit, m).unwrap();

        let body = unit.method_mut(m).unwrap().body.as_mut().unwrap();
        body.replace(leave, Instr::Ret).unwrap();
        assert!(analyze_method(&unit, m).unwrap_err().is_return_in_protected_region());
    }
}
