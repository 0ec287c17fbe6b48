//! Lowering from the OOX AST to a labelled control-flow graph.
//!
//! `if` and `while` never become nodes. The guard is split into a pair of
//! `assume guard` / `assume !guard` statement nodes and both become
//! successors of the preceding program point; infeasible branches are pruned
//! by the interpreter when it executes the assume. `break`/`continue`/`return`
//! produce nodes whose only outgoing edge jumps to the loop exit, the loop
//! head, or the member exit.

use crate::cfg::{ControlFlowGraph, MemberRef, NodeId, NodeKind};
use crate::symbols::{ClassInfo, MemberInfo, SymbolTable};
use oox_syntax::{CompilationUnit, DeclarationMember, Expression, Rhs, Span, Statement};
use thiserror::Error;

/// CFG construction error.
#[derive(Debug, Error)]
pub enum CfgError {
    #[error("duplicate member '{name}'")]
    DuplicateMember { name: String },

    #[error("'break' outside of a loop at {span}")]
    BreakOutsideLoop { span: Span },

    #[error("'continue' outside of a loop at {span}")]
    ContinueOutsideLoop { span: Span },
}

pub type CfgResult<T> = Result<T, CfgError>;

/// Build the control-flow graph and symbol table for a compilation unit.
pub fn build(unit: &CompilationUnit) -> CfgResult<(ControlFlowGraph, SymbolTable)> {
    let mut builder = CfgBuilder::new();
    builder.lower_unit(unit)?;
    Ok((builder.cfg, builder.symbols))
}

/// The set of dangling program points while lowering a statement.
#[derive(Debug, Clone, Default)]
struct Flow {
    /// Nodes control enters through.
    entries: Vec<NodeId>,
    /// Nodes whose successor is whatever comes next.
    exits: Vec<NodeId>,
}

impl Flow {
    fn single(id: NodeId) -> Self {
        Self {
            entries: vec![id],
            exits: vec![id],
        }
    }

    /// A node that never falls through (return, throw, break, continue).
    fn diverging(id: NodeId) -> Self {
        Self {
            entries: vec![id],
            exits: Vec::new(),
        }
    }
}

/// Per-loop lowering context for `break`/`continue` wiring.
struct LoopFrame {
    /// The assume pair forming the loop head.
    head: Vec<NodeId>,
    /// `break` nodes, wired to the statement after the loop.
    breaks: Vec<NodeId>,
}

struct CfgBuilder {
    cfg: ControlFlowGraph,
    symbols: SymbolTable,
    next_id: NodeId,
    loops: Vec<LoopFrame>,
    member_exit: NodeId,
}

impl CfgBuilder {
    fn new() -> Self {
        Self {
            cfg: ControlFlowGraph::new(),
            symbols: SymbolTable::new(),
            next_id: 0,
            loops: Vec::new(),
            member_exit: 0,
        }
    }

    fn fresh(&mut self, kind: NodeKind) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        self.cfg.insert(id, kind)
    }

    fn lower_unit(&mut self, unit: &CompilationUnit) -> CfgResult<()> {
        for class in &unit.classes {
            let fields: Vec<_> = class
                .fields()
                .map(|(name, ty)| (name.clone(), ty.clone()))
                .collect();
            self.symbols.insert_class(
                class.name.clone(),
                ClassInfo {
                    fields,
                },
            );
            for member in &class.members {
                if member.is_method_like() {
                    self.lower_member(&class.name, member)?;
                }
            }
        }
        Ok(())
    }

    fn lower_member(&mut self, class_name: &str, member: &DeclarationMember) -> CfgResult<()> {
        let member_ref = MemberRef::new(class_name, member.name().clone());
        let return_type = match member {
            DeclarationMember::Method { return_type, .. } => return_type.runtime_type(),
            DeclarationMember::Constructor { .. } => {
                oox_syntax::RuntimeType::Reference(class_name.to_string())
            }
            DeclarationMember::Field { .. } => unreachable!("fields are not lowered"),
        };

        let entry = self.fresh(NodeKind::MemberEntry {
            member: member_ref.clone(),
        });
        let exit = self.fresh(NodeKind::MemberExit {
            return_type,
            member: member_ref.clone(),
        });
        self.member_exit = exit;

        let body = match member {
            DeclarationMember::Method { body, .. } => body,
            DeclarationMember::Constructor { body, .. } => body,
            DeclarationMember::Field { .. } => unreachable!(),
        };
        let flow = self.lower_statement(body)?;
        for e in &flow.entries {
            self.cfg.connect(entry, *e);
        }
        if flow.entries.is_empty() {
            self.cfg.connect(entry, exit);
        }
        for x in &flow.exits {
            self.cfg.connect(*x, exit);
        }

        let info = MemberInfo {
            class_name: class_name.to_string(),
            decl: member.clone(),
            entry,
            exit,
        };
        if self.symbols.insert_member(member_ref.clone(), info).is_some() {
            return Err(CfgError::DuplicateMember {
                name: member_ref.to_string(),
            });
        }
        Ok(())
    }

    fn lower_statement(&mut self, stmt: &Statement) -> CfgResult<Flow> {
        match stmt {
            Statement::Block { body, span } => self.lower_block(body, *span),
            Statement::Ite {
                guard,
                true_body,
                false_body,
                span,
            } => self.lower_ite(guard, true_body, false_body.as_deref(), *span),
            Statement::While { guard, body, span } => self.lower_while(guard, body, *span),
            Statement::Continue { span } => {
                let id = self.fresh(NodeKind::Statement(stmt.clone()));
                let head = match self.loops.last() {
                    Some(frame) => frame.head.clone(),
                    None => return Err(CfgError::ContinueOutsideLoop { span: *span }),
                };
                for h in head {
                    self.cfg.connect(id, h);
                }
                Ok(Flow::diverging(id))
            }
            Statement::Break { span } => {
                let id = self.fresh(NodeKind::Statement(stmt.clone()));
                match self.loops.last_mut() {
                    Some(frame) => frame.breaks.push(id),
                    None => return Err(CfgError::BreakOutsideLoop { span: *span }),
                }
                Ok(Flow::diverging(id))
            }
            Statement::Return { .. } => {
                let id = self.fresh(NodeKind::Statement(stmt.clone()));
                self.cfg.connect(id, self.member_exit);
                Ok(Flow::diverging(id))
            }
            Statement::Throw { message, .. } => {
                let id = self.fresh(NodeKind::Exceptional {
                    message: message.clone(),
                });
                Ok(Flow::diverging(id))
            }
            Statement::Try {
                try_body,
                catch_body,
                ..
            } => self.lower_try(try_body, catch_body),
            Statement::Call { invocation, .. } => {
                let id = self.fresh(NodeKind::Call {
                    invocation: invocation.clone(),
                    target: None,
                });
                Ok(self.seal_call(id))
            }
            Statement::Assign { lhs, rhs, .. } => {
                if let Rhs::Call { invocation, .. } = rhs {
                    let id = self.fresh(NodeKind::Call {
                        invocation: invocation.clone(),
                        target: Some(lhs.clone()),
                    });
                    Ok(self.seal_call(id))
                } else {
                    Ok(Flow::single(self.fresh(NodeKind::Statement(stmt.clone()))))
                }
            }
            Statement::Join { .. } => Ok(Flow::single(self.fresh(NodeKind::Join))),
            // Remaining statements are atomic.
            Statement::Declare { .. }
            | Statement::Skip { .. }
            | Statement::Assert { .. }
            | Statement::Assume { .. }
            | Statement::Lock { .. }
            | Statement::Unlock { .. }
            | Statement::Fork { .. } => {
                Ok(Flow::single(self.fresh(NodeKind::Statement(stmt.clone()))))
            }
        }
    }

    /// Call nodes must have exactly one successor (the return point), so a
    /// synthetic skip is appended; the statement after the call may expand
    /// into several entry nodes.
    fn seal_call(&mut self, call: NodeId) -> Flow {
        let skip = self.fresh(NodeKind::Statement(Statement::Skip {
            span: Span::synthetic(),
        }));
        self.cfg.connect(call, skip);
        Flow {
            entries: vec![call],
            exits: vec![skip],
        }
    }

    fn lower_block(&mut self, body: &[Statement], span: Span) -> CfgResult<Flow> {
        if body.is_empty() {
            let id = self.fresh(NodeKind::Statement(Statement::Skip { span }));
            return Ok(Flow::single(id));
        }
        let mut flow = Flow::default();
        let mut open: Vec<NodeId> = Vec::new();
        for (i, stmt) in body.iter().enumerate() {
            let next = self.lower_statement(stmt)?;
            if i == 0 {
                flow.entries = next.entries.clone();
            }
            for from in &open {
                for to in &next.entries {
                    self.cfg.connect(*from, *to);
                }
            }
            open = next.exits;
        }
        flow.exits = open;
        Ok(flow)
    }

    fn lower_ite(
        &mut self,
        guard: &Expression,
        true_body: &Statement,
        false_body: Option<&Statement>,
        span: Span,
    ) -> CfgResult<Flow> {
        let assume_t = self.fresh(NodeKind::Statement(Statement::Assume {
            assumption: guard.clone(),
            span,
        }));
        let assume_f = self.fresh(NodeKind::Statement(Statement::Assume {
            assumption: Expression::not(guard.clone()),
            span,
        }));

        let t_flow = self.lower_statement(true_body)?;
        for e in &t_flow.entries {
            self.cfg.connect(assume_t, *e);
        }
        let mut exits = t_flow.exits;

        match false_body {
            Some(fb) => {
                let f_flow = self.lower_statement(fb)?;
                for e in &f_flow.entries {
                    self.cfg.connect(assume_f, *e);
                }
                exits.extend(f_flow.exits);
            }
            None => exits.push(assume_f),
        }

        Ok(Flow {
            entries: vec![assume_t, assume_f],
            exits,
        })
    }

    fn lower_while(
        &mut self,
        guard: &Expression,
        body: &Statement,
        span: Span,
    ) -> CfgResult<Flow> {
        let assume_t = self.fresh(NodeKind::Statement(Statement::Assume {
            assumption: guard.clone(),
            span,
        }));
        let assume_f = self.fresh(NodeKind::Statement(Statement::Assume {
            assumption: Expression::not(guard.clone()),
            span,
        }));

        self.loops.push(LoopFrame {
            head: vec![assume_t, assume_f],
            breaks: Vec::new(),
        });
        let body_flow = self.lower_statement(body)?;
        let frame = self.loops.pop().expect("frame pushed above");

        for e in &body_flow.entries {
            self.cfg.connect(assume_t, *e);
        }
        // Loop back: the end of the body re-evaluates the guard.
        for x in &body_flow.exits {
            self.cfg.connect(*x, assume_t);
            self.cfg.connect(*x, assume_f);
        }

        let mut exits = vec![assume_f];
        exits.extend(frame.breaks);
        Ok(Flow {
            entries: vec![assume_t, assume_f],
            exits,
        })
    }

    fn lower_try(&mut self, try_body: &Statement, catch_body: &Statement) -> CfgResult<Flow> {
        let catch_entry = self.fresh(NodeKind::CatchEntry);
        let try_entry = self.fresh(NodeKind::TryEntry {
            handler: catch_entry,
        });
        let try_exit = self.fresh(NodeKind::TryExit);
        let catch_exit = self.fresh(NodeKind::CatchExit);

        let t_flow = self.lower_statement(try_body)?;
        for e in &t_flow.entries {
            self.cfg.connect(try_entry, *e);
        }
        for x in &t_flow.exits {
            self.cfg.connect(*x, try_exit);
        }

        let c_flow = self.lower_statement(catch_body)?;
        for e in &c_flow.entries {
            self.cfg.connect(catch_entry, *e);
        }
        for x in &c_flow.exits {
            self.cfg.connect(*x, catch_exit);
        }

        Ok(Flow {
            entries: vec![try_entry],
            exits: vec![try_exit, catch_exit],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oox_syntax::parse;

    fn build_source(source: &str) -> (ControlFlowGraph, SymbolTable) {
        let unit = parse(source).expect("parse");
        build(&unit).expect("cfg")
    }

    #[test]
    fn test_straight_line_member() {
        let (cfg, symbols) = build_source(
            "class C {
                static void m() {
                    int x;
                    x := 1;
                }
            }",
        );
        let member = symbols.lookup("C", "m").expect("member");
        // entry -> declare -> assign -> exit
        let declare = cfg.successors(member.entry)[0];
        let assign = cfg.successors(declare)[0];
        assert_eq!(cfg.successors(assign), &[member.exit]);
        assert!(cfg.successors(member.exit).is_empty());
    }

    #[test]
    fn test_ite_splits_into_assume_pair() {
        let (cfg, symbols) = build_source(
            "class C {
                static void m(int x) {
                    if (x > 0) {
                        skip;
                    } else {
                        skip;
                    }
                }
            }",
        );
        let member = symbols.lookup("C", "m").expect("member");
        let succs = cfg.successors(member.entry);
        assert_eq!(succs.len(), 2);
        for s in succs {
            let NodeKind::Statement(Statement::Assume { .. }) = cfg.kind(*s) else {
                panic!("expected assume node, got {:?}", cfg.kind(*s));
            };
        }
    }

    #[test]
    fn test_while_loops_back_to_guard() {
        let (cfg, symbols) = build_source(
            "class C {
                static void m(int x) {
                    while (x > 0) {
                        x := x - 1;
                    }
                }
            }",
        );
        let member = symbols.lookup("C", "m").expect("member");
        let head = cfg.successors(member.entry);
        assert_eq!(head.len(), 2);
        let assume_t = head[0];
        let body = cfg.successors(assume_t)[0];
        // The body exit re-enters both assume nodes.
        let back = cfg.successors(body);
        assert_eq!(back.len(), 2);
        assert!(back.contains(&head[0]) && back.contains(&head[1]));
    }

    #[test]
    fn test_call_node_has_single_successor() {
        let (cfg, symbols) = build_source(
            "class C {
                static void m() {
                    C.n();
                    if (true) { skip; }
                }
                static void n() { skip; }
            }",
        );
        let member = symbols.lookup("C", "m").expect("member");
        let call = cfg.successors(member.entry)[0];
        assert!(matches!(cfg.kind(call), NodeKind::Call { .. }));
        assert_eq!(cfg.successors(call).len(), 1);
    }

    #[test]
    fn test_try_catch_structure() {
        let (cfg, symbols) = build_source(
            "class C {
                static void m() {
                    try {
                        throw \"x\";
                    } catch {
                        skip;
                    }
                }
            }",
        );
        let member = symbols.lookup("C", "m").expect("member");
        let try_entry = cfg.successors(member.entry)[0];
        let NodeKind::TryEntry { handler } = cfg.kind(try_entry) else {
            panic!("expected try entry");
        };
        assert!(matches!(cfg.kind(*handler), NodeKind::CatchEntry));
        // The throw node has no static successors.
        let throw = cfg.successors(try_entry)[0];
        assert!(matches!(cfg.kind(throw), NodeKind::Exceptional { .. }));
        assert!(cfg.successors(throw).is_empty());
    }

    #[test]
    fn test_return_jumps_to_member_exit() {
        let (cfg, symbols) = build_source(
            "class C {
                static int m() {
                    return 1;
                    skip;
                }
            }",
        );
        let member = symbols.lookup("C", "m").expect("member");
        let ret = cfg.successors(member.entry)[0];
        assert_eq!(cfg.successors(ret), &[member.exit]);
    }

    #[test]
    fn test_break_outside_loop_rejected() {
        let unit = parse(
            "class C {
                static void m() {
                    break;
                }
            }",
        )
        .expect("parse");
        assert!(matches!(
            build(&unit),
            Err(CfgError::BreakOutsideLoop { .. })
        ));
    }

    #[test]
    fn test_duplicate_member_rejected() {
        let unit = parse(
            "class C {
                static void m() { skip; }
                static void m() { skip; }
            }",
        )
        .expect("parse");
        assert!(matches!(
            build(&unit),
            Err(CfgError::DuplicateMember { .. })
        ));
    }
}
