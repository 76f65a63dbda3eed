//! The RISC-U emulator (§4.4, §4.5, §4.6): paged virtual memory, contexts,
//! the fetch/decode/execute loop, and the kernel that services syscalls.

pub mod context;
pub mod interpreter;
pub mod kernel;
pub mod memory;
pub mod symbolic_interpreter;

pub use context::{Context, ContextId, ContextPool};
pub use interpreter::{Interpreter, SyscallHandler};
pub use kernel::Kernel;
pub use memory::Memory;
pub use symbolic_interpreter::SymbolicInterpreter;
