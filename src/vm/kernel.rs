//! Kernel and syscalls (§4.6): `exit`, `read`, `write`, `open`, `brk`,
//! `input`, `switch`, plus the page-fault handler and the ELF boot/loader.
//! Three platform flag triples are tried in order for `open` (§4.6), kept
//! as an explicit ordered list rather than `#[cfg(target_os)]` branching
//! since the guest itself is unaware of the host OS.
//!
//! `switch` (§4.6, component K "Context manager") actually hosts the
//! target context to completion or timeout rather than stubbing the
//! syscall out: see `Syscalls::switch_to`. Nested `switch` calls compose,
//! since `switch_to` recurses through the same `SyscallHandler` impl, so a
//! hosted context can itself host a further child (§3 "boot level").
//!
//! [`Kernel::run_monster`] is `run`'s symbolic twin (§4.10): it drives
//! [`super::symbolic_interpreter::SymbolicInterpreter`] instead of
//! `Interpreter`, delegates every syscall but `input` straight to the same
//! `Syscalls` this module already uses for `run`, and backtracks through
//! `Engine`'s branch stack between paths rather than stopping at the
//! first exit.

use std::fs::{File, OpenOptions};

use log::{info, warn};

use crate::common::INSTRUCTION_SIZE;
use crate::elf;
use crate::error::{Exception, ExitCode};
use crate::isa::Register;
use crate::symbolic::msiid::Value;
use crate::symbolic::{Engine, Summary};

use super::context::{Context, ContextId, ContextPool};
use super::interpreter::{Interpreter, SyscallHandler};
use super::memory::{Memory, PAGE_SIZE};
use super::symbolic_interpreter::SymbolicInterpreter;

pub const SYSCALL_EXIT: u64 = 93;
pub const SYSCALL_READ: u64 = 63;
pub const SYSCALL_WRITE: u64 = 64;
pub const SYSCALL_OPEN: u64 = 1024;
pub const SYSCALL_BRK: u64 = 214;
pub const SYSCALL_INPUT: u64 = 42;
pub const SYSCALL_SWITCH: u64 = 401;

/// The stack starts one page below the top of the virtual address space.
const INITIAL_SP: u64 = super::memory::VIRTUAL_MEMORY_SIZE - PAGE_SIZE;

#[derive(Debug, Default)]
pub struct RunSummary {
    pub mallocated: u64,
    pub read: u64,
    pub wrote: u64,
}

pub struct Kernel {
    pub contexts: ContextPool,
    pub memory: Memory,
    pub interpreter: Interpreter,
    files: Vec<File>,
    pub summary: RunSummary,
}

impl Kernel {
    pub fn new(timeslice: u64) -> Self {
        Kernel {
            contexts: ContextPool::new(),
            memory: Memory::new(),
            interpreter: Interpreter::new(timeslice),
            files: Vec::new(),
            summary: RunSummary::default(),
        }
    }

    /// Loads `binary` into a fresh context: code and data pages are mapped
    /// and populated eagerly (unlike heap/stack pages, which stay
    /// lazily mapped, §4.5), `sp` is set to the top of the address space,
    /// and `program_break`/`original_break` start just past the data
    /// segment.
    pub fn boot(&mut self, binary: &elf::Binary, name: impl Into<String>) -> ContextId {
        let id = self.contexts.spawn(name, None);
        let ctx = self.contexts.get_mut(id);
        ctx.pc = 0x10000;
        ctx.regs[Register::Sp.index()] = INITIAL_SP;
        ctx.hi_page = INITIAL_SP / PAGE_SIZE;

        let mut vaddr = ctx.pc;
        for pair in binary.code.chunks(2) {
            let low = crate::isa::encode(pair[0]).expect("emitted instruction should re-encode");
            let high = pair
                .get(1)
                .map(|&i| crate::isa::encode(i).expect("emitted instruction should re-encode"))
                .unwrap_or(0);
            let word = (low as u64) | ((high as u64) << 32);
            self.memory.map_and_store_double_word(&mut ctx.page_table, vaddr, word);
            vaddr += 8;
        }
        for chunk in binary.data.chunks(8) {
            let mut bytes = [0u8; 8];
            bytes[..chunk.len()].copy_from_slice(chunk);
            self.memory.map_and_store_double_word(&mut ctx.page_table, vaddr, u64::from_le_bytes(bytes));
            vaddr += 8;
        }
        ctx.me_page = vaddr.div_ceil(PAGE_SIZE);
        ctx.program_break = vaddr;
        ctx.original_break = vaddr;
        id
    }

    /// Runs `id` to completion, dispatching syscalls and page faults
    /// until the context exits.
    pub fn run(&mut self, id: ContextId) -> i32 {
        let mut ctx = self.contexts.take(id);
        let exit_code = loop {
            let Kernel { interpreter, memory, contexts, files, summary } = &mut *self;
            let mut syscalls = Syscalls { contexts, files, summary };
            let exception = interpreter.run_until_exception(&mut ctx, memory, &mut syscalls);
            if let Some(code) = Self::handle_exception(memory, &mut ctx, exception) {
                break code;
            }
        };
        self.contexts.put_back(id, ctx);
        info!(
            "exit {exit_code}: {} mallocated, {} read, {} wrote",
            self.summary.mallocated, self.summary.read, self.summary.wrote
        );
        exit_code
    }

    /// Runs `id` symbolically (§2 rows L-O, §4.10 "the outer monster
    /// loop"): every path the interval domain can split `sltu` into is
    /// explored depth-first, backtracking into the next pending sub-case
    /// each time a path exits (or itself faults), until the branch stack
    /// drains. Returns the last-explored path's exit code alongside the
    /// full [`Summary`] (exit-code interval, witnesses) across every path.
    pub fn run_monster(&mut self, id: ContextId) -> (i32, Summary) {
        let mut ctx = self.contexts.take(id);
        let mut engine = Engine::new();
        let mut summary = Summary::default();
        let mut interp = SymbolicInterpreter::new(self.interpreter.timeslice);
        let mut last_code = 0;

        loop {
            let Kernel { memory, contexts, files, summary: run_summary, .. } = &mut *self;
            let mut syscalls = Syscalls { contexts, files, summary: run_summary };
            let exception = interp.run_until_exception(&mut ctx, memory, &mut engine, &mut syscalls);
            ctx.take_exception();

            let terminal_code = match exception {
                Exception::PageFault(vaddr) => {
                    memory.fault_in(&mut ctx.page_table, vaddr);
                    None
                }
                Exception::Syscall => ctx.exit_code.take(),
                Exception::Timer => {
                    if engine.tick_path_length() {
                        Some(ExitCode::MaxPathLength.code())
                    } else {
                        None
                    }
                }
                Exception::DivisionByZero => Some(ExitCode::DivisionByZero.code()),
                Exception::UnknownInstruction(_) => Some(ExitCode::UnknownInstruction.code()),
                Exception::InvalidAddress(_) => Some(ExitCode::UncaughtException.code()),
                Exception::MaxTrace => Some(ExitCode::OutOfTraceMemory.code()),
                Exception::MaxCorrection => Some(ExitCode::OutOfTraceMemory.code()),
                Exception::Incompleteness => Some(ExitCode::Incompleteness.code()),
                Exception::MultipleException { .. } => Some(ExitCode::MultipleExceptionError.code()),
            };

            let Some(code) = terminal_code else { continue };
            summary.record_path(code, &engine);
            last_code = code;

            match engine.backtrack() {
                // Resumes the `true` sub-case (§4.10): `rs1` is rewritten to
                // its narrowed interval, `rd` (if not `x0`) to the concrete
                // `1` the comparison now yields, and `fp`/`sp` restored to
                // what they were at the branch point, since both are plain
                // concrete context fields the trace doesn't track.
                Some(branch) => {
                    ctx.regs[Register::Fp.index()] = branch.fp;
                    ctx.regs[Register::Sp.index()] = branch.sp;
                    ctx.pc = branch.pc + INSTRUCTION_SIZE;
                    ctx.exit_code = None;
                    let _ = engine.trace.store(branch.pc, branch.rs1_vaddr, Value::Interval(branch.rs1), engine.trace.mrcc);
                    ctx.regs[branch.rs1_vaddr as usize] = branch.rs1.start;
                    if let Some(rd_vaddr) = branch.rd_vaddr {
                        let _ = engine.trace.store(branch.pc, rd_vaddr, Value::Concrete(1), engine.trace.mrcc);
                        ctx.regs[rd_vaddr as usize] = 1;
                    }
                }
                None => break,
            }
        }

        debug_assert!(engine.is_clean(), "the branch stack should be drained once exploration ends");
        self.contexts.put_back(id, ctx);
        info!("monster: {summary}");
        (last_code, summary)
    }

    /// Dispatches an exception that escaped `run_until_exception` (§7).
    /// Returns `Some(code)` if the context is finished, `None` if
    /// execution should resume.
    fn handle_exception(memory: &mut Memory, ctx: &mut Context, exception: Exception) -> Option<i32> {
        ctx.take_exception();
        match exception {
            Exception::PageFault(vaddr) => {
                memory.fault_in(&mut ctx.page_table, vaddr);
                None
            }
            // Every recognized syscall (including an unrecognized syscall
            // *number*, which sets `exit_code` to `UnknownSyscall` itself)
            // traps here; only `exit` actually terminates the context.
            Exception::Syscall => ctx.exit_code,
            Exception::DivisionByZero => Some(crate::error::ExitCode::DivisionByZero.code()),
            Exception::UnknownInstruction(_) => Some(crate::error::ExitCode::UnknownInstruction.code()),
            Exception::Timer => None,
            Exception::InvalidAddress(_) => Some(crate::error::ExitCode::UncaughtException.code()),
            Exception::MaxTrace => Some(crate::error::ExitCode::OutOfTraceMemory.code()),
            Exception::MaxCorrection => Some(crate::error::ExitCode::OutOfTraceMemory.code()),
            Exception::Incompleteness => Some(crate::error::ExitCode::Incompleteness.code()),
            Exception::MultipleException { .. } => {
                Some(crate::error::ExitCode::MultipleExceptionError.code())
            }
        }
    }
}

struct Syscalls<'a> {
    contexts: &'a mut ContextPool,
    files: &'a mut Vec<File>,
    summary: &'a mut RunSummary,
}

impl<'a> SyscallHandler for Syscalls<'a> {
    fn syscall(&mut self, ctx: &mut Context, memory: &mut Memory) -> Result<(), Exception> {
        let number = ctx.regs[Register::A7.index()];
        match number {
            SYSCALL_EXIT => {
                ctx.exit_code = Some(ctx.regs[Register::A0.index()] as i32);
            }
            SYSCALL_BRK => {
                let requested = ctx.regs[Register::A0.index()];
                let sp = ctx.regs[Register::Sp.index()];
                let ok = requested >= ctx.program_break && requested <= sp && requested % 8 == 0;
                if ok {
                    ctx.program_break = requested;
                }
                ctx.regs[Register::A0.index()] = ctx.program_break;
            }
            SYSCALL_READ => {
                let fd = ctx.regs[Register::A0.index()];
                let buf = ctx.regs[Register::A1.index()];
                let size = ctx.regs[Register::A2.index()];
                let n = self.host_read(fd, buf, size, ctx, memory)?;
                self.summary.read += n;
                ctx.regs[Register::A0.index()] = n;
            }
            SYSCALL_WRITE => {
                let fd = ctx.regs[Register::A0.index()];
                let buf = ctx.regs[Register::A1.index()];
                let size = ctx.regs[Register::A2.index()];
                let n = self.host_write(fd, buf, size, ctx, memory)?;
                self.summary.wrote += n;
                ctx.regs[Register::A0.index()] = n;
            }
            SYSCALL_OPEN => {
                let name_addr = ctx.regs[Register::A0.index()];
                let name = read_c_string(ctx, memory, name_addr)?;
                let fd = self.host_open(&name).unwrap_or(u64::MAX);
                ctx.regs[Register::A0.index()] = fd;
            }
            SYSCALL_INPUT => {
                // Concrete mode has no oracle to ask; the symbolic engine
                // wraps this syscall with its own MSIID-producing handler
                // (§4.11). Here the requested lower bound is returned as-is.
            }
            SYSCALL_SWITCH => {
                let to = ctx.regs[Register::A0.index()] as ContextId;
                let timeout = ctx.regs[Register::A1.index()];
                if to >= self.contexts.len() {
                    ctx.regs[Register::A0.index()] = u64::MAX;
                } else {
                    ctx.regs[Register::A0.index()] = self.switch_to(ctx, memory, to, timeout);
                }
            }
            _ => {
                warn!("unknown syscall a7={number}");
                ctx.exit_code = Some(crate::error::ExitCode::UnknownSyscall.code());
            }
        }
        Err(Exception::Syscall)
    }
}

impl<'a> Syscalls<'a> {
    fn host_read(
        &mut self,
        fd: u64,
        buf: u64,
        size: u64,
        ctx: &mut Context,
        memory: &mut Memory,
    ) -> Result<u64, Exception> {
        use std::io::Read;
        let mut scratch = vec![0u8; size as usize];
        let n = if fd == 0 {
            std::io::stdin().read(&mut scratch).unwrap_or(0)
        } else {
            self.files
                .get_mut((fd - 3) as usize)
                .and_then(|f| f.read(&mut scratch).ok())
                .unwrap_or(0)
        };
        write_guest_bytes(ctx, memory, buf, &scratch[..n])?;
        Ok(n as u64)
    }

    fn host_write(
        &mut self,
        fd: u64,
        buf: u64,
        size: u64,
        ctx: &mut Context,
        memory: &mut Memory,
    ) -> Result<u64, Exception> {
        use std::io::Write;
        let bytes = read_guest_bytes(ctx, memory, buf, size as usize)?;
        let n = if fd == 1 {
            std::io::stdout().write(&bytes).unwrap_or(0)
        } else if fd == 2 {
            std::io::stderr().write(&bytes).unwrap_or(0)
        } else {
            self.files
                .get_mut((fd - 3) as usize)
                .and_then(|f| f.write(&bytes).ok())
                .unwrap_or(0)
        };
        Ok(n as u64)
    }

    /// Hosts `to`'s context as a nested guest until it yields an exception
    /// or `timeout` instructions elapse (§4.6 "switch(to, timeout) saves
    /// the current context, transfers to the cached child context, and
    /// sets the timer"). `ctx` is already effectively saved: it's held
    /// outside the pool for the whole nested call, exactly as `Kernel::run`
    /// holds the top-level context. A fresh, short-lived `Interpreter`
    /// carries `timeout` as its own timeslice, since `Interpreter` holds no
    /// state beyond the timer/timeslice pair. Returns `to`, the id of the
    /// context that just ran and yielded (glossary: `switch(to, timeout) →
    /// prev_ctx`), so the caller can switch back to it later.
    fn switch_to(&mut self, ctx: &mut Context, memory: &mut Memory, to: ContextId, timeout: u64) -> u64 {
        let mut target = self.contexts.take(to);
        ctx.virtual_context = Some(to);
        let mut nested_interp = Interpreter::new(timeout);
        loop {
            let mut nested = Syscalls {
                contexts: &mut *self.contexts,
                files: &mut *self.files,
                summary: &mut *self.summary,
            };
            let exception = nested_interp.run_until_exception(&mut target, memory, &mut nested);
            if matches!(exception, Exception::Timer) {
                break;
            }
            if Kernel::handle_exception(memory, &mut target, exception).is_some() {
                break;
            }
        }
        self.contexts.put_back(to, target);
        ctx.virtual_context = None;
        to as u64
    }

    /// Tries write-only-create flag triples in the order a portable guest
    /// would encounter them across hosts (§4.6).
    fn host_open(&mut self, name: &str) -> Option<u64> {
        const FLAG_TRIPLES: [(bool, bool, bool); 3] = [
            (true, true, true),   // create, write, truncate (typical POSIX)
            (true, true, false),  // create, write, append
            (false, true, false), // write to an existing file only
        ];
        for (create, write, truncate) in FLAG_TRIPLES {
            let opened = OpenOptions::new()
                .create(create)
                .write(write)
                .truncate(truncate)
                .read(true)
                .open(name);
            if let Ok(file) = opened {
                self.files.push(file);
                return Some(self.files.len() as u64 - 1 + 3);
            }
        }
        None
    }
}

/// Copies through the guest page table one double word at a time,
/// page-fault-checking each one (§4.6) by mapping it in directly: a
/// syscall runs with kernel privilege and has already committed to
/// returning a byte count, so there's no guest instruction left to retry
/// if it unwound through `Exception::PageFault` instead.
fn read_guest_bytes(
    ctx: &mut Context,
    memory: &mut Memory,
    addr: u64,
    len: usize,
) -> Result<Vec<u8>, Exception> {
    if !Memory::is_valid_address(addr) {
        return Err(Exception::InvalidAddress(addr));
    }
    let mut out = Vec::with_capacity(len);
    let mut remaining = len;
    let mut addr = addr;
    while remaining > 0 {
        let paddr = memory.fault_in(&mut ctx.page_table, addr);
        let word = memory.frames.read_u64(paddr);
        let take = remaining.min(8);
        out.extend_from_slice(&word.to_le_bytes()[..take]);
        remaining -= take;
        addr += 8;
    }
    Ok(out)
}

fn write_guest_bytes(
    ctx: &mut Context,
    memory: &mut Memory,
    addr: u64,
    bytes: &[u8],
) -> Result<(), Exception> {
    if !Memory::is_valid_address(addr) {
        return Err(Exception::InvalidAddress(addr));
    }
    let mut addr = addr;
    for chunk in bytes.chunks(8) {
        let mut word = [0u8; 8];
        word[..chunk.len()].copy_from_slice(chunk);
        memory.map_and_store_double_word(&mut ctx.page_table, addr, u64::from_le_bytes(word));
        addr += 8;
    }
    Ok(())
}

fn read_c_string(ctx: &mut Context, memory: &mut Memory, mut addr: u64) -> Result<String, Exception> {
    if !Memory::is_valid_address(addr) {
        return Err(Exception::InvalidAddress(addr));
    }
    let mut bytes = Vec::new();
    loop {
        let paddr = memory.fault_in(&mut ctx.page_table, addr);
        let word = memory.frames.read_u64(paddr);
        for b in word.to_le_bytes() {
            if b == 0 {
                return Ok(String::from_utf8_lossy(&bytes).into_owned());
            }
            bytes.push(b);
        }
        addr += 8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::parse;
    use crate::middle::lower;

    fn build(src: &str) -> elf::Binary {
        let ast = parse(src).unwrap();
        let (tir, _) = lower(&ast).unwrap();
        let buffer = crate::back::emit(&tir).unwrap();
        elf::Binary { code: buffer.code().to_vec(), data: buffer.data().to_vec() }
    }

    #[test]
    fn switch_runs_the_target_context_to_completion_and_returns_its_id() {
        let host_binary = build("uint64_t main() { return 0; }");
        let child_binary = build("uint64_t main() { return 7; }");
        let mut kernel = Kernel::new(0);
        let host_id = kernel.boot(&host_binary, "host");
        let child_id = kernel.boot(&child_binary, "child");

        let mut host_ctx = kernel.contexts.take(host_id);
        host_ctx.regs[Register::A0.index()] = child_id as u64;
        host_ctx.regs[Register::A1.index()] = 1000;
        host_ctx.regs[Register::A7.index()] = SYSCALL_SWITCH;
        let mut files = Vec::new();
        let mut summary = RunSummary::default();
        let mut syscalls = Syscalls { contexts: &mut kernel.contexts, files: &mut files, summary: &mut summary };
        syscalls.syscall(&mut host_ctx, &mut kernel.memory).unwrap_err();

        assert_eq!(host_ctx.regs[Register::A0.index()], child_id as u64);
        assert!(host_ctx.virtual_context.is_none());
        assert_eq!(kernel.contexts.get(child_id).exit_code, Some(7));
    }

    #[test]
    fn switching_to_an_out_of_range_context_reports_failure() {
        let host_binary = build("uint64_t main() { return 0; }");
        let mut kernel = Kernel::new(0);
        let host_id = kernel.boot(&host_binary, "host");
        let mut host_ctx = kernel.contexts.take(host_id);
        host_ctx.regs[Register::A0.index()] = 99;
        host_ctx.regs[Register::A7.index()] = SYSCALL_SWITCH;
        let mut files = Vec::new();
        let mut summary = RunSummary::default();
        let mut syscalls = Syscalls { contexts: &mut kernel.contexts, files: &mut files, summary: &mut summary };
        syscalls.syscall(&mut host_ctx, &mut kernel.memory).unwrap_err();
        assert_eq!(host_ctx.regs[Register::A0.index()], u64::MAX);
    }

    #[test]
    fn runs_a_trivial_program_to_its_return_code() {
        let binary = build("uint64_t main() { return 42; }");
        let mut kernel = Kernel::new(0);
        let id = kernel.boot(&binary, "main");
        let code = kernel.run(id);
        assert_eq!(code, 42);
    }

    #[test]
    fn brk_rejects_a_shrink_below_the_break() {
        let binary = build("uint64_t main() { return 0; }");
        let mut kernel = Kernel::new(0);
        let id = kernel.boot(&binary, "main");
        let mut ctx = kernel.contexts.take(id);
        let original = ctx.program_break;
        ctx.regs[Register::A0.index()] = original.saturating_sub(8);
        ctx.regs[Register::A7.index()] = SYSCALL_BRK;
        let mut files = Vec::new();
        let mut summary = RunSummary::default();
        let mut syscalls = Syscalls { contexts: &mut kernel.contexts, files: &mut files, summary: &mut summary };
        syscalls.syscall(&mut ctx, &mut kernel.memory).unwrap_err();
        assert_eq!(ctx.program_break, original);
        assert_eq!(ctx.regs[Register::A0.index()], original);
    }
}
