//! Fetch/decode/execute (§4.4): the concrete `do_*` path. Symbolic
//! execution layers its own `constrain_*`/`backtrack_*` dispatch on top of
//! this same instruction set in [`crate::symbolic`], rather than forking
//! the interpreter — both modes decode the same way and only the
//! arithmetic/branch handling differs.

use log::trace;

use crate::common::INSTRUCTION_SIZE;
use crate::error::Exception;
use crate::isa::{decode, Instruction, Register};

use super::context::Context;
use super::memory::Memory;

/// Serviced by the kernel (§4.6): an `ecall` traps here so the
/// interpreter never has to know about syscall numbers or host I/O.
pub trait SyscallHandler {
    fn syscall(&mut self, ctx: &mut Context, memory: &mut Memory) -> Result<(), Exception>;
}

pub struct Interpreter {
    /// Decremented every instruction; hitting zero throws `Timer` (§4.4).
    pub timer: u64,
    pub timeslice: u64,
}

impl Interpreter {
    pub fn new(timeslice: u64) -> Self {
        Interpreter { timer: timeslice, timeslice }
    }

    /// Executes instructions on `ctx` until an exception is thrown (or the
    /// timer runs out), mirroring `run_until_exception` (§5 "Suspension
    /// points").
    pub fn run_until_exception(
        &mut self,
        ctx: &mut Context,
        memory: &mut Memory,
        syscalls: &mut dyn SyscallHandler,
    ) -> Exception {
        loop {
            match self.step(ctx, memory, syscalls) {
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
        syscalls: &mut dyn SyscallHandler,
    ) -> Result<(), Exception> {
        debug_assert_eq!(ctx.pc % INSTRUCTION_SIZE, 0, "pc must stay instruction-aligned");
        let word = memory.load_double_word(&mut ctx.page_table, ctx.pc & !7)?;
        let half = if ctx.pc % 8 == 0 { word as u32 } else { (word >> 32) as u32 };
        let insn = decode(half).ok_or(Exception::UnknownInstruction(half as u64))?;
        trace!("{:#x}: {insn}", ctx.pc);

        self.execute(ctx, memory, syscalls, insn)?;

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
        syscalls: &mut dyn SyscallHandler,
        insn: Instruction,
    ) -> Result<(), Exception> {
        use Instruction::*;
        let mut next_pc = ctx.pc + INSTRUCTION_SIZE;
        match insn {
            Lui { rd, imm } => write_reg(ctx, rd, imm as u64),
            Addi { rd, rs1, imm } => write_reg(ctx, rd, read_reg(ctx, rs1).wrapping_add(imm as u64)),
            Add { rd, rs1, rs2 } => write_reg(ctx, rd, read_reg(ctx, rs1).wrapping_add(read_reg(ctx, rs2))),
            Sub { rd, rs1, rs2 } => write_reg(ctx, rd, read_reg(ctx, rs1).wrapping_sub(read_reg(ctx, rs2))),
            Mul { rd, rs1, rs2 } => write_reg(ctx, rd, read_reg(ctx, rs1).wrapping_mul(read_reg(ctx, rs2))),
            Divu { rd, rs1, rs2 } => {
                let rhs = read_reg(ctx, rs2);
                if rhs == 0 {
                    return Err(Exception::DivisionByZero);
                }
                write_reg(ctx, rd, read_reg(ctx, rs1) / rhs);
            }
            Remu { rd, rs1, rs2 } => {
                let rhs = read_reg(ctx, rs2);
                if rhs == 0 {
                    return Err(Exception::DivisionByZero);
                }
                write_reg(ctx, rd, read_reg(ctx, rs1) % rhs);
            }
            Sltu { rd, rs1, rs2 } => {
                write_reg(ctx, rd, (read_reg(ctx, rs1) < read_reg(ctx, rs2)) as u64)
            }
            Ld { rd, rs1, imm } => {
                let addr = read_reg(ctx, rs1).wrapping_add(imm as u64);
                let value = memory.load_double_word(&mut ctx.page_table, addr)?;
                write_reg(ctx, rd, value);
            }
            Sd { rs1, rs2, imm } => {
                let addr = read_reg(ctx, rs1).wrapping_add(imm as u64);
                memory.store_double_word(&mut ctx.page_table, addr, read_reg(ctx, rs2))?;
            }
            Beq { rs1, rs2, imm } => {
                if read_reg(ctx, rs1) == read_reg(ctx, rs2) {
                    next_pc = ctx.pc.wrapping_add(imm as u64);
                }
            }
            Jal { rd, imm } => {
                write_reg(ctx, rd, next_pc);
                next_pc = ctx.pc.wrapping_add(imm as u64);
            }
            Jalr { rd, rs1, imm } => {
                let target = read_reg(ctx, rs1).wrapping_add(imm as u64);
                write_reg(ctx, rd, next_pc);
                next_pc = target;
            }
            Ecall => {
                ctx.pc = next_pc;
                syscalls.syscall(ctx, memory)?;
                return Ok(());
            }
        }
        ctx.pc = next_pc;
        Ok(())
    }
}

/// Reads `r`, always yielding 0 for `x0` (§4.4 "writes to x0 are ignored").
fn read_reg(ctx: &Context, r: Register) -> u64 {
    ctx.regs[r.index()]
}

fn write_reg(ctx: &mut Context, r: Register, value: u64) {
    if r != Register::Zero {
        ctx.regs[r.index()] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::memory::Memory;

    struct NoSyscalls;
    impl SyscallHandler for NoSyscalls {
        fn syscall(&mut self, ctx: &mut Context, _memory: &mut Memory) -> Result<(), Exception> {
            ctx.exit_code = Some(ctx.regs[Register::A0.index()] as i32);
            Err(Exception::Syscall)
        }
    }

    #[test]
    fn adds_two_immediates() {
        let mut ctx = Context::new("t", None);
        let mut memory = Memory::new();
        let mut interp = Interpreter::new(0);
        interp
            .execute(&mut ctx, &mut memory, &mut NoSyscalls, Instruction::Addi {
                rd: Register::T0,
                rs1: Register::Zero,
                imm: 7,
            })
            .unwrap();
        assert_eq!(ctx.regs[Register::T0.index()], 7);
    }

    #[test]
    fn writes_to_zero_register_are_ignored() {
        let mut ctx = Context::new("t", None);
        let mut memory = Memory::new();
        let mut interp = Interpreter::new(0);
        interp
            .execute(&mut ctx, &mut memory, &mut NoSyscalls, Instruction::Addi {
                rd: Register::Zero,
                rs1: Register::Zero,
                imm: 7,
            })
            .unwrap();
        assert_eq!(ctx.regs[Register::Zero.index()], 0);
    }

    #[test]
    fn division_by_zero_throws() {
        let mut ctx = Context::new("t", None);
        let mut memory = Memory::new();
        let mut interp = Interpreter::new(0);
        let err = interp.execute(&mut ctx, &mut memory, &mut NoSyscalls, Instruction::Divu {
            rd: Register::T0,
            rs1: Register::T1,
            rs2: Register::Zero,
        });
        assert_eq!(err, Err(Exception::DivisionByZero));
    }

    #[test]
    fn timer_expires_after_timeslice() {
        let mut ctx = Context::new("t", None);
        let mut memory = Memory::new();
        let nop = crate::isa::encode(Instruction::Addi {
            rd: Register::Zero,
            rs1: Register::Zero,
            imm: 0,
        })
        .unwrap();
        memory.map_and_store_double_word(&mut ctx.page_table, 0x10000, nop as u64);
        let mut interp = Interpreter::new(1);
        let exception = interp.run_until_exception(&mut ctx, &mut memory, &mut NoSyscalls);
        assert_eq!(exception, Exception::Timer);
    }
}
