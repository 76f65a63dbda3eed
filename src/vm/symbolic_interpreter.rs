//! Fetch/decode/execute in symbolic mode (§4.4's `constrain_*`/`backtrack_*`
//! dispatch, promised by the module doc comment on [`super::interpreter`]):
//! the same decode table as the concrete interpreter, but `sltu` consults
//! [`Engine::constrain_sltu`] instead of comparing two `u64`s outright, and
//! every other arithmetic instruction falls back to the concrete `do_*`
//! path the moment both its operands turn out not to be symbolic. Register
//! and memory values only grow a [`Trace`] entry once something symbolic
//! (`input`, or a value derived from it) touches them; everything else
//! keeps running exactly as the concrete interpreter does, which is why
//! this module reuses the concrete path's own `SyscallHandler` for every
//! syscall but `input` (§4.11) rather than re-deriving `exit`/`read`/
//! `write`/`brk`/`open`/`switch`.

use log::trace as log_trace;

use crate::common::INSTRUCTION_SIZE;
use crate::error::Exception;
use crate::isa::{decode, Instruction, Register};
use crate::symbolic::msiid::{self, Correction, Interval, Value};
use crate::symbolic::{register_vaddr, Engine};

use super::context::Context;
use super::interpreter::SyscallHandler;
use super::kernel::SYSCALL_INPUT;
use super::memory::Memory;

/// Mirrors [`super::Interpreter`]'s timer/timeslice pair; kept as a
/// distinct type rather than a mode flag on `Interpreter` since the two
/// `execute` bodies genuinely diverge (§4.4).
pub struct SymbolicInterpreter {
    pub timer: u64,
    pub timeslice: u64,
}

impl SymbolicInterpreter {
    pub fn new(timeslice: u64) -> Self {
        SymbolicInterpreter { timer: timeslice, timeslice }
    }

    pub fn run_until_exception(
        &mut self,
        ctx: &mut Context,
        memory: &mut Memory,
        engine: &mut Engine,
        syscalls: &mut dyn SyscallHandler,
    ) -> Exception {
        loop {
            match self.step(ctx, memory, engine, syscalls) {
                Ok(()) => continue,
                Err(exception) => {
                    if let Err(fatal) = ctx.throw(exception) {
                        return fatal;
                    }
                    return exception;
                }
            }
        }
    }

    fn step(
        &mut self,
        ctx: &mut Context,
        memory: &mut Memory,
        engine: &mut Engine,
        syscalls: &mut dyn SyscallHandler,
    ) -> Result<(), Exception> {
        debug_assert_eq!(ctx.pc % INSTRUCTION_SIZE, 0, "pc must stay instruction-aligned");
        let word = memory.load_double_word(&ctx.page_table, ctx.pc & !7)?;
        let half = if ctx.pc % 8 == 0 { word as u32 } else { (word >> 32) as u32 };
        let insn = decode(half).ok_or(Exception::UnknownInstruction(half as u64))?;
        log_trace!("{:#x}: {insn} (symbolic)", ctx.pc);

        self.execute(ctx, memory, engine, syscalls, insn)?;

        if self.timeslice != 0 {
            self.timer = self.timer.saturating_sub(1);
            if self.timer == 0 {
                self.timer = self.timeslice;
                return Err(Exception::Timer);
            }
        }
        Ok(())
    }

    fn execute(
        &mut self,
        ctx: &mut Context,
        memory: &mut Memory,
        engine: &mut Engine,
        syscalls: &mut dyn SyscallHandler,
        insn: Instruction,
    ) -> Result<(), Exception> {
        use Instruction::*;
        let mut next_pc = ctx.pc + INSTRUCTION_SIZE;
        match insn {
            Lui { rd, imm } => write_value(ctx, engine, ctx.pc, rd, Value::Concrete(imm as u64), None, Correction::identity())?,
            Addi { rd, rs1, imm } => {
                let a = value_of(ctx, engine, rs1);
                let (value, source, correction) = match a {
                    Value::Concrete(v) => (Value::Concrete(v.wrapping_add(imm as u64)), None, Correction::identity()),
                    Value::Interval(i) => {
                        let (result, correction) = msiid::addi(i, imm);
                        (Value::Interval(result), Some(register_vaddr(rs1)), correction)
                    }
                    Value::Array { base, length } => {
                        (Value::Array { base: base.wrapping_add(imm as u64), length }, Some(register_vaddr(rs1)), Correction::identity())
                    }
                };
                write_value(ctx, engine, ctx.pc, rd, value, source, correction)?;
            }
            Add { rd, rs1, rs2 } => {
                let (a, b) = (value_of(ctx, engine, rs1), value_of(ctx, engine, rs2));
                match (a, b) {
                    (Value::Concrete(x), Value::Concrete(y)) => {
                        write_value(ctx, engine, ctx.pc, rd, Value::Concrete(x.wrapping_add(y)), None, Correction::identity())?;
                    }
                    _ => {
                        let result = msiid::add(a.as_interval(), b.as_interval()).map_err(|_| Exception::Incompleteness)?;
                        write_value(ctx, engine, ctx.pc, rd, Value::Interval(result), None, Correction::default())?;
                    }
                }
            }
            Sub { rd, rs1, rs2 } => {
                let (a, b) = (value_of(ctx, engine, rs1), value_of(ctx, engine, rs2));
                match (a, b) {
                    (Value::Concrete(x), Value::Concrete(y)) => {
                        write_value(ctx, engine, ctx.pc, rd, Value::Concrete(x.wrapping_sub(y)), None, Correction::identity())?;
                    }
                    _ => {
                        let result = msiid::sub(a.as_interval(), b.as_interval()).map_err(|_| Exception::Incompleteness)?;
                        write_value(ctx, engine, ctx.pc, rd, Value::Interval(result), None, Correction::default())?;
                    }
                }
            }
            Mul { rd, rs1, rs2 } => {
                let (a, b) = (value_of(ctx, engine, rs1), value_of(ctx, engine, rs2));
                match (as_scalar(a), as_scalar(b)) {
                    (Some(x), Some(y)) => {
                        write_value(ctx, engine, ctx.pc, rd, Value::Concrete(x.wrapping_mul(y)), None, Correction::identity())?;
                    }
                    (None, Some(k)) => {
                        let (result, correction) = msiid::mul(a.as_interval(), k).map_err(|_| Exception::Incompleteness)?;
                        write_value(ctx, engine, ctx.pc, rd, Value::Interval(result), Some(register_vaddr(rs1)), correction)?;
                    }
                    (Some(k), None) => {
                        let (result, correction) = msiid::mul(b.as_interval(), k).map_err(|_| Exception::Incompleteness)?;
                        write_value(ctx, engine, ctx.pc, rd, Value::Interval(result), Some(register_vaddr(rs2)), correction)?;
                    }
                    (None, None) => return Err(Exception::Incompleteness),
                }
            }
            Divu { rd, rs1, rs2 } => {
                let (a, b) = (value_of(ctx, engine, rs1), value_of(ctx, engine, rs2));
                let k = as_scalar(b).ok_or(Exception::Incompleteness)?;
                if k == 0 {
                    return Err(Exception::DivisionByZero);
                }
                match a {
                    Value::Concrete(x) => write_value(ctx, engine, ctx.pc, rd, Value::Concrete(x / k), None, Correction::identity())?,
                    _ => {
                        let (result, correction) = msiid::divu(a.as_interval(), k).map_err(|_| Exception::Incompleteness)?;
                        write_value(ctx, engine, ctx.pc, rd, Value::Interval(result), Some(register_vaddr(rs1)), correction)?;
                    }
                }
            }
            Remu { rd, rs1, rs2 } => {
                let (a, b) = (value_of(ctx, engine, rs1), value_of(ctx, engine, rs2));
                let k = as_scalar(b).ok_or(Exception::Incompleteness)?;
                if k == 0 {
                    return Err(Exception::DivisionByZero);
                }
                match a {
                    Value::Concrete(x) => write_value(ctx, engine, ctx.pc, rd, Value::Concrete(x % k), None, Correction::identity())?,
                    _ => {
                        let (result, correction) = msiid::remu(a.as_interval(), k).map_err(|_| Exception::Incompleteness)?;
                        write_value(ctx, engine, ctx.pc, rd, Value::Interval(result), Some(register_vaddr(rs1)), correction)?;
                    }
                }
            }
            Sltu { rd, rs1, rs2 } => {
                let (a, b) = (value_of(ctx, engine, rs1), value_of(ctx, engine, rs2));
                match (a, b) {
                    (Value::Concrete(x), Value::Concrete(y)) => {
                        write_value(ctx, engine, ctx.pc, rd, Value::Concrete((x < y) as u64), None, Correction::identity())?;
                    }
                    _ => {
                        let rd_vaddr = if rd == Register::Zero { None } else { Some(register_vaddr(rd)) };
                        let taken = engine.constrain_sltu(
                            ctx.pc,
                            ctx.regs[Register::Fp.index()],
                            ctx.regs[Register::Sp.index()],
                            a.as_interval(),
                            b.as_interval(),
                            register_vaddr(rs1),
                            rd_vaddr,
                        )?;
                        write_value(ctx, engine, ctx.pc, rd, Value::Concrete(taken), None, Correction::default())?;
                    }
                }
            }
            Ld { rd, rs1, imm } => {
                let addr = addr_of(ctx, engine, rs1, imm)?;
                let concrete = memory.load_double_word(&ctx.page_table, addr)?;
                let value = engine.trace.latest_value(addr).unwrap_or(Value::Concrete(concrete));
                write_value(ctx, engine, ctx.pc, rd, value, Some(addr), Correction::identity())?;
            }
            Sd { rs1, rs2, imm } => {
                let addr = addr_of(ctx, engine, rs1, imm)?;
                let value = value_of(ctx, engine, rs2);
                let witness = witness_of(value);
                memory.store_double_word(&ctx.page_table, addr, witness)?;
                if !matches!(value, Value::Concrete(_)) || engine.trace.latest_tc(addr).is_some() {
                    engine.propagate_assignment(ctx.pc, addr, Some(register_vaddr(rs2)), value, Correction::identity())?;
                }
            }
            Beq { rs1, rs2, imm } => {
                let (a, b) = (value_of(ctx, engine, rs1), value_of(ctx, engine, rs2));
                match (a, b) {
                    (Value::Concrete(x), Value::Concrete(y)) => {
                        if x == y {
                            next_pc = ctx.pc.wrapping_add(imm as u64);
                        }
                    }
                    // RISC-U codegen always routes a symbolic comparison
                    // through `sltu` first (§4.10), so a still-symbolic
                    // operand reaching `beq` directly means the branch
                    // engine's domain (MSIID) can't represent this program.
                    _ => return Err(Exception::Incompleteness),
                }
            }
            Jal { rd, imm } => {
                write_value(ctx, engine, ctx.pc, rd, Value::Concrete(next_pc), None, Correction::identity())?;
                next_pc = ctx.pc.wrapping_add(imm as u64);
            }
            Jalr { rd, rs1, imm } => {
                let target = addr_of(ctx, engine, rs1, imm)?;
                write_value(ctx, engine, ctx.pc, rd, Value::Concrete(next_pc), None, Correction::identity())?;
                next_pc = target;
            }
            Ecall => {
                ctx.pc = next_pc;
                if ctx.regs[Register::A7.index()] == SYSCALL_INPUT {
                    let start = ctx.regs[Register::A0.index()];
                    let end = ctx.regs[Register::A1.index()];
                    let step = ctx.regs[Register::A2.index()].max(1);
                    engine.input(register_vaddr(Register::A0), ctx.pc, start, end, step)?;
                    return Err(Exception::Syscall);
                }
                syscalls.syscall(ctx, memory)?;
                return Ok(());
            }
        }
        ctx.pc = next_pc;
        Ok(())
    }
}

/// The current value of `r`: whatever the trace holds, or the register's
/// plain concrete content when nothing symbolic has ever touched it.
fn value_of(ctx: &Context, engine: &Engine, r: Register) -> Value {
    if r == Register::Zero {
        return Value::Concrete(0);
    }
    engine.trace.latest_value(register_vaddr(r)).unwrap_or(Value::Concrete(ctx.regs[r.index()]))
}

fn as_scalar(v: Value) -> Option<u64> {
    match v {
        Value::Concrete(c) => Some(c),
        Value::Interval(i) if i.is_singleton() => Some(i.start),
        _ => None,
    }
}

fn witness_of(v: Value) -> u64 {
    match v {
        Value::Concrete(c) => c,
        Value::Interval(i) => i.start,
        Value::Array { base, .. } => base,
    }
}

/// Resolves `rs1 + imm` to a concrete address. Symbolic addressing (an
/// address itself depending on unresolved input) isn't representable by
/// this domain, so it's `Incompleteness` rather than a guess.
fn addr_of(ctx: &Context, engine: &Engine, rs1: Register, imm: i64) -> Result<u64, Exception> {
    match value_of(ctx, engine, rs1) {
        Value::Concrete(v) => Ok(v.wrapping_add(imm as u64)),
        other => as_scalar(other).map(|v| v.wrapping_add(imm as u64)).ok_or(Exception::Incompleteness),
    }
}

/// Writes `value` to `rd` (a no-op for `x0`): the register always keeps a
/// concrete witness (an interval's `start`, for addressing and for any
/// concrete-only downstream read), and grows a trace entry exactly when
/// the value is genuinely symbolic or the register was already tracked
/// (§4.9 "propagate forward to every live alias").
fn write_value(
    ctx: &mut Context,
    engine: &mut Engine,
    pc: u64,
    rd: Register,
    value: Value,
    source: Option<u64>,
    correction: Correction,
) -> Result<(), Exception> {
    if rd == Register::Zero {
        return Ok(());
    }
    ctx.regs[rd.index()] = witness_of(value);
    let symbolic = !matches!(value, Value::Concrete(_));
    let already_tracked = engine.trace.latest_tc(register_vaddr(rd)).is_some();
    if symbolic || already_tracked {
        engine.propagate_assignment(pc, register_vaddr(rd), source, value, correction)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::context::Context;
    use crate::vm::memory::Memory;

    struct NoSyscalls;
    impl SyscallHandler for NoSyscalls {
        fn syscall(&mut self, ctx: &mut Context, _memory: &mut Memory) -> Result<(), Exception> {
            ctx.exit_code = Some(ctx.regs[Register::A0.index()] as i32);
            Err(Exception::Syscall)
        }
    }

    #[test]
    fn a_concrete_only_instruction_stream_never_touches_the_trace() {
        let mut ctx = Context::new("t", None);
        let mut memory = Memory::new();
        let mut engine = Engine::new();
        let mut interp = SymbolicInterpreter::new(0);
        interp
            .execute(&mut ctx, &mut memory, &mut engine, &mut NoSyscalls, Instruction::Addi {
                rd: Register::T0,
                rs1: Register::Zero,
                imm: 7,
            })
            .unwrap();
        assert_eq!(ctx.regs[Register::T0.index()], 7);
        assert!(engine.trace.is_empty());
    }

    #[test]
    fn input_widens_into_a_trace_entry() {
        let mut ctx = Context::new("t", None);
        let mut memory = Memory::new();
        let mut engine = Engine::new();
        let mut interp = SymbolicInterpreter::new(0);
        ctx.regs[Register::A0.index()] = 0;
        ctx.regs[Register::A1.index()] = 9;
        ctx.regs[Register::A2.index()] = 1;
        ctx.regs[Register::A7.index()] = SYSCALL_INPUT;
        let err = interp.execute(&mut ctx, &mut memory, &mut engine, &mut NoSyscalls, Instruction::Ecall);
        assert_eq!(err, Err(Exception::Syscall));
        assert_eq!(engine.trace.latest_value(register_vaddr(Register::A0)), Some(Value::Interval(Interval::new(0, 9, 1))));
    }

    #[test]
    fn a_symbolic_sltu_splits_and_keeps_the_false_case_concrete() {
        let mut ctx = Context::new("t", None);
        let mut memory = Memory::new();
        let mut engine = Engine::new();
        let mut interp = SymbolicInterpreter::new(0);
        engine.input(register_vaddr(Register::T0), ctx.pc, 0, 9, 1).unwrap();
        ctx.regs[Register::T1.index()] = 5;
        interp
            .execute(&mut ctx, &mut memory, &mut engine, &mut NoSyscalls, Instruction::Sltu {
                rd: Register::T2,
                rs1: Register::T0,
                rs2: Register::T1,
            })
            .unwrap();
        assert_eq!(ctx.regs[Register::T2.index()], 0);
        assert_eq!(engine.branches.len(), 1);
    }

    #[test]
    fn a_symbolic_divisor_is_incomplete() {
        let mut ctx = Context::new("t", None);
        let mut memory = Memory::new();
        let mut engine = Engine::new();
        let mut interp = SymbolicInterpreter::new(0);
        engine.input(register_vaddr(Register::T1), ctx.pc, 1, 9, 1).unwrap();
        ctx.regs[Register::T0.index()] = 10;
        let err = interp.execute(&mut ctx, &mut memory, &mut engine, &mut NoSyscalls, Instruction::Divu {
            rd: Register::T2,
            rs1: Register::T0,
            rs2: Register::T1,
        });
        assert_eq!(err, Err(Exception::Incompleteness));
    }
}
