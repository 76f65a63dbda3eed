//! AST → TIR lowering (§4.2). Also where the symbol table gets populated:
//! each declaration is entered as it is seen. A call to an
//! as-yet-undeclared procedure is not rejected here — it auto-declares a
//! `PROCEDURE` symbol with the default `UINT64_T` return type, exactly as
//! the original single-pass design does, and is left for the emitter to
//! resolve via a forward fixup chain (or the undefined-procedure stub if
//! it never gets defined, §4.2/§8 scenario 6).

use crate::common::Id;
use crate::error::CompileError;
use crate::front::ast::{self, BinOp, Expr, Literal, Program as Ast, Stmt, TopLevelDecl};

use super::symtab::{Entry, Kind, SymbolTable};
use super::tir::{Block, Global, Instruction, Procedure, Program, Terminator};

pub struct Lowerer {
    symtab: SymbolTable,
    temps: u64,
    labels: u64,
    globals: Vec<Global>,
    procedures: crate::common::Map<Id, Procedure>,
    strings: crate::common::Map<Id, Vec<u8>>,
    errors: Vec<CompileError>,
}

pub fn lower(ast: &Ast) -> Result<(Program, SymbolTable), Vec<CompileError>> {
    let mut lowerer = Lowerer {
        symtab: SymbolTable::new(),
        temps: 0,
        labels: 0,
        globals: Vec::new(),
        procedures: crate::common::Map::new(),
        strings: crate::common::Map::new(),
        errors: Vec::new(),
    };
    lowerer.lower_program(ast);
    if lowerer.errors.is_empty() {
        Ok((
            Program { globals: lowerer.globals, procedures: lowerer.procedures, strings: lowerer.strings },
            lowerer.symtab,
        ))
    } else {
        Err(lowerer.errors)
    }
}

struct BlockBuilder {
    label: Id,
    insns: Vec<Instruction>,
    finished: Vec<Block>,
}

impl Lowerer {
    fn fresh_temp(&mut self) -> Id {
        let id = Id::from(format!("%t{}", self.temps));
        self.temps += 1;
        id
    }

    fn fresh_label(&mut self) -> Id {
        // The '%' sigil can't appear in a source identifier (the scanner
        // only accepts alnum/underscore), so generated labels can never
        // collide with a user-declared name.
        let id = Id::from(format!("%L{}", self.labels));
        self.labels += 1;
        id
    }

    fn error(&mut self, line: u64, message: impl Into<String>) {
        self.errors.push(CompileError::Compiler { line, message: message.into() });
    }

    fn lower_program(&mut self, ast: &Ast) {
        for decl in &ast.decls {
            if let TopLevelDecl::Global { ty, name, init, line } = decl {
                if self.symtab.global.contains(name) {
                    self.error(*line, format!("global '{name}' already declared"));
                    continue;
                }
                self.symtab.global.declare(
                    *name,
                    Entry { ty: *ty, kind: Kind::Global, address: 0, defined: true, line: *line },
                );
                let value = match init {
                    Some(Literal::Integer(v)) => *v,
                    Some(Literal::Character(c)) => *c as u64,
                    None => 0,
                };
                self.globals.push(Global { name: *name, ty: *ty, init: value });
            }
        }
        for decl in &ast.decls {
            if let TopLevelDecl::Procedure(proc) = decl {
                self.declare_procedure_signature(proc);
            }
        }
        for decl in &ast.decls {
            if let TopLevelDecl::Procedure(proc) = decl {
                if proc.body.is_some() {
                    self.lower_procedure(proc);
                }
            }
        }
    }

    fn declare_procedure_signature(&mut self, proc: &ast::Procedure) {
        match self.symtab.global.get(&proc.name) {
            Some(existing) if existing.kind != Kind::Procedure => {
                self.error(proc.line, format!("'{}' redeclared as a procedure", proc.name));
            }
            Some(existing) if existing.defined && proc.body.is_some() => {
                self.error(proc.line, format!("procedure '{}' redefined", proc.name));
            }
            _ => {
                self.symtab.global.declare(
                    proc.name,
                    Entry {
                        ty: proc.return_type,
                        kind: Kind::Procedure,
                        address: 0,
                        defined: proc.body.is_some(),
                        line: proc.line,
                    },
                );
            }
        }
    }

    fn lower_procedure(&mut self, proc: &ast::Procedure) {
        self.symtab.enter_procedure();
        let mut locals = Vec::new();
        for (ty, name) in &proc.params {
            self.symtab.local.declare(
                *name,
                Entry { ty: *ty, kind: Kind::Parameter, address: 0, defined: true, line: proc.line },
            );
            locals.push(*name);
        }

        let entry_label = self.fresh_label();
        let mut builder = BlockBuilder { label: entry_label, insns: Vec::new(), finished: Vec::new() };
        self.collect_locals(proc.body.as_ref().unwrap(), &mut locals);
        for stmt in proc.body.as_ref().unwrap() {
            self.lower_stmt(stmt, &mut builder);
        }
        // An implicit `return;` covers a body that falls off the end —
        // the original tolerates this for void-like control flow.
        builder.finished.push(Block {
            label: builder.label,
            insns: std::mem::take(&mut builder.insns),
            term: Terminator::Return(None),
        });

        self.procedures.insert(
            proc.name,
            Procedure {
                name: proc.name,
                params: proc.params.iter().map(|(_, n)| *n).collect(),
                locals,
                blocks: builder.finished,
                entry: entry_label,
                is_defined: true,
            },
        );
    }

    fn collect_locals(&mut self, stmts: &[Stmt], locals: &mut Vec<Id>) {
        for stmt in stmts {
            match stmt {
                Stmt::VarDecl { ty, name, line } => {
                    if self.symtab.local.contains(name) {
                        self.error(*line, format!("local '{name}' already declared"));
                        continue;
                    }
                    self.symtab.local.declare(
                        *name,
                        Entry { ty: *ty, kind: Kind::Local, address: 0, defined: true, line: *line },
                    );
                    locals.push(*name);
                }
                Stmt::Block(inner) => self.collect_locals(inner, locals),
                Stmt::If { tt, ff, .. } => {
                    self.collect_locals(tt, locals);
                    self.collect_locals(ff, locals);
                }
                Stmt::While { body, .. } => self.collect_locals(body, locals),
                _ => {}
            }
        }
    }

    fn lower_stmt(&mut self, stmt: &Stmt, b: &mut BlockBuilder) {
        match stmt {
            Stmt::VarDecl { .. } => {}
            Stmt::Assign { name, value, line } => {
                if self.symtab.lookup(name).is_none() {
                    self.error(*line, format!("undeclared variable '{name}'"));
                }
                let src = self.lower_expr(value, b);
                b.insns.push(Instruction::Copy { dst: *name, src });
            }
            Stmt::StoreDeref { address, value, .. } => {
                let addr = self.lower_expr(address, b);
                let src = self.lower_expr(value, b);
                b.insns.push(Instruction::Store { addr, src });
            }
            Stmt::Call { name, args, line } => {
                self.lower_call(None, *name, args, *line, b);
            }
            Stmt::Return { value, .. } => {
                let result = value.as_ref().map(|e| self.lower_expr(e, b));
                let next = self.fresh_label();
                b.finish(Terminator::Return(result), next);
            }
            Stmt::Block(stmts) => {
                for s in stmts {
                    self.lower_stmt(s, b);
                }
            }
            Stmt::If { guard, tt, ff, .. } => {
                let (op, lhs, rhs) = self.lower_condition(guard, b);
                let then_label = self.fresh_label();
                let else_label = self.fresh_label();
                let after_label = self.fresh_label();
                b.finish(
                    Terminator::Branch { op, lhs, rhs, tt: then_label, ff: else_label },
                    then_label,
                );
                for s in tt {
                    self.lower_stmt(s, b);
                }
                b.finish(Terminator::Jump(after_label), else_label);
                for s in ff {
                    self.lower_stmt(s, b);
                }
                b.finish(Terminator::Jump(after_label), after_label);
            }
            Stmt::While { guard, body, .. } => {
                let head_label = self.fresh_label();
                b.finish(Terminator::Jump(head_label), head_label);
                let (op, lhs, rhs) = self.lower_condition(guard, b);
                let body_label = self.fresh_label();
                let after_label = self.fresh_label();
                b.finish(
                    Terminator::Branch { op, lhs, rhs, tt: body_label, ff: after_label },
                    body_label,
                );
                for s in body {
                    self.lower_stmt(s, b);
                }
                b.finish(Terminator::Jump(head_label), after_label);
            }
        }
    }

    /// `beq`'s comparison is always equality (§3): a source-level
    /// `lhs < rhs` first computes `sltu` into a temp and then branches
    /// on that temp being nonzero, which is why every guard bottoms out
    /// here as `(Eq, probe, zero-temp)` after materializing the boolean.
    fn lower_condition(&mut self, guard: &Expr, b: &mut BlockBuilder) -> (BinOp, Id, Id) {
        let value = self.lower_expr(guard, b);
        let zero = self.fresh_temp();
        b.insns.push(Instruction::Const { dst: zero, value: 0 });
        (BinOp::Neq, value, zero)
    }

    fn lower_call(
        &mut self,
        dst: Option<Id>,
        name: Id,
        args: &[Expr],
        line: u64,
        b: &mut BlockBuilder,
    ) {
        match self.symtab.global.get(&name) {
            Some(existing) if existing.kind != Kind::Procedure => {
                self.error(line, format!("'{name}' called but not declared as a procedure"));
            }
            None => {
                self.symtab.global.declare(
                    name,
                    Entry {
                        ty: ast::Type::Uint64,
                        kind: Kind::Procedure,
                        address: 0,
                        defined: false,
                        line,
                    },
                );
            }
            Some(_) => {}
        }
        let arg_ids = args.iter().map(|a| self.lower_expr(a, b)).collect();
        b.insns.push(Instruction::Call { dst, callee: name, args: arg_ids });
    }

    fn lower_expr(&mut self, expr: &Expr, b: &mut BlockBuilder) -> Id {
        match expr {
            Expr::Var(name, line) => {
                if self.symtab.lookup(name).is_none() {
                    self.error(*line, format!("undeclared variable '{name}'"));
                }
                *name
            }
            Expr::Literal(Literal::Integer(v), _) => {
                let dst = self.fresh_temp();
                b.insns.push(Instruction::Const { dst, value: *v });
                dst
            }
            Expr::Literal(Literal::Character(c), _) => {
                let dst = self.fresh_temp();
                b.insns.push(Instruction::Const { dst, value: *c as u64 });
                dst
            }
            Expr::StringLiteral(s, _) => {
                let name = Id::from(format!("%str{:x}", crate::common::string_hash(s)));
                self.strings.entry(name).or_insert_with(|| s.as_bytes().to_vec());
                let dst = self.fresh_temp();
                b.insns.push(Instruction::AddrOf { dst, name });
                dst
            }
            Expr::Call { name, args, line } => {
                let dst = self.fresh_temp();
                self.lower_call(Some(dst), *name, args, *line, b);
                dst
            }
            Expr::Deref(inner, _) => {
                let addr = self.lower_expr(inner, b);
                let dst = self.fresh_temp();
                b.insns.push(Instruction::Load { dst, addr });
                dst
            }
            Expr::Negate(inner, _) => {
                let value = self.lower_expr(inner, b);
                let zero = self.fresh_temp();
                b.insns.push(Instruction::Const { dst: zero, value: 0 });
                let dst = self.fresh_temp();
                b.insns.push(Instruction::Arith { op: BinOp::Sub, dst, lhs: zero, rhs: value });
                dst
            }
            Expr::Cast { expr, .. } => self.lower_expr(expr, b),
            Expr::BinOp { op, lhs, rhs, .. } => {
                let l = self.lower_expr(lhs, b);
                let r = self.lower_expr(rhs, b);
                let dst = self.fresh_temp();
                b.insns.push(Instruction::Arith { op: *op, dst, lhs: l, rhs: r });
                dst
            }
        }
    }
}

impl BlockBuilder {
    /// Closes the current block with `term`, then opens a new one named
    /// `next_label` that subsequent instructions append to.
    fn finish(&mut self, term: Terminator, next_label: Id) {
        self.finished.push(Block {
            label: self.label,
            insns: std::mem::take(&mut self.insns),
            term,
        });
        self.label = next_label;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::parse;

    #[test]
    fn lowers_trivial_return() {
        let ast = parse("uint64_t main() { return 42; }").unwrap();
        let (tir, _) = lower(&ast).unwrap();
        let main = tir.procedures.get(&Id::from("main".to_string())).unwrap();
        assert!(!main.blocks.is_empty());
    }

    #[test]
    fn rejects_undeclared_variable() {
        let ast = parse("uint64_t main() { return x; }").unwrap();
        assert!(lower(&ast).is_err());
    }

    #[test]
    fn globals_carry_their_initializer() {
        let ast = parse("uint64_t x = 7; uint64_t main() { return x; }").unwrap();
        let (tir, _) = lower(&ast).unwrap();
        assert_eq!(tir.globals[0].init, 7);
    }
}
