//! The three error families of §7: compile-time diagnostics, guest
//! exceptions, and host exit codes.
//!
//! Per the Design Notes (§9 "Error propagation"), `Exception` is the
//! interpreter's primary error type — every `do_*`/`constrain_*` helper
//! returns `Result<(), Exception>` and `?`-propagates up to the kernel's
//! `handle_exception`, which is the only place that matches it
//! exhaustively. Compile-time errors are a separate, distinct enum that
//! never reaches the emulator.

use derive_more::Display;

/// Diagnostics raised by the scanner, parser, or encoder (§7: "Compile-time
/// errors ... print a line-number-stamped diagnostic to stdout and exit
/// immediately").
#[derive(Debug, Clone, Display)]
pub enum CompileError {
    #[display("{line}: scanner error: {message}")]
    Scanner { line: u64, message: String },
    #[display("{line}: syntax error: {message}")]
    Parser { line: u64, message: String },
    #[display("{line}: compiler error: {message}")]
    Compiler { line: u64, message: String },
}

impl std::error::Error for CompileError {}

impl CompileError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            CompileError::Scanner { .. } => ExitCode::ScannerError,
            CompileError::Parser { .. } => ExitCode::ParserError,
            CompileError::Compiler { .. } => ExitCode::CompilerError,
        }
    }
}

/// Guest-visible exceptions thrown into the current context (§4.4, §7). A
/// context may hold at most one pending exception; a second, different one
/// is the fatal `MultipleExceptionError`, which is why `throw` below is
/// fallible rather than a plain setter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Exception {
    #[display("page fault at {_0:#x}")]
    PageFault(u64),
    #[display("syscall trap")]
    Syscall,
    #[display("timer")]
    Timer,
    #[display("invalid virtual address {_0:#x}")]
    InvalidAddress(u64),
    #[display("division by zero")]
    DivisionByZero,
    #[display("unknown instruction {_0:#x}")]
    UnknownInstruction(u64),
    #[display("symbolic trace exhausted")]
    MaxTrace,
    #[display("correction table exhausted")]
    MaxCorrection,
    #[display("symbolic reasoning incomplete")]
    Incompleteness,
    #[display("multiple simultaneous exceptions: {first} then {second}")]
    MultipleException { first: &'static str, second: &'static str },
}

impl std::error::Error for Exception {}

impl Exception {
    pub const fn name(&self) -> &'static str {
        match self {
            Exception::PageFault(_) => "PAGEFAULT",
            Exception::Syscall => "SYSCALL",
            Exception::Timer => "TIMER",
            Exception::InvalidAddress(_) => "INVALIDADDRESS",
            Exception::DivisionByZero => "DIVISIONBYZERO",
            Exception::UnknownInstruction(_) => "UNKNOWNINSTRUCTION",
            Exception::MaxTrace => "MAXTRACE",
            Exception::MaxCorrection => "MAXCORRECTION",
            Exception::Incompleteness => "INCOMPLETENESS",
            Exception::MultipleException { .. } => "MULTIPLEEXCEPTIONERROR",
        }
    }
}

/// Host exit codes, §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[repr(u8)]
pub enum ExitCode {
    #[display("no error")]
    NoError = 0,
    #[display("bad arguments")]
    BadArguments = 1,
    #[display("I/O error")]
    IoError = 2,
    #[display("scanner error")]
    ScannerError = 3,
    #[display("parser error")]
    ParserError = 4,
    #[display("compiler error")]
    CompilerError = 5,
    #[display("out of virtual memory")]
    OutOfVirtualMemory = 6,
    #[display("out of physical memory")]
    OutOfPhysicalMemory = 7,
    #[display("division by zero")]
    DivisionByZero = 8,
    #[display("unknown instruction")]
    UnknownInstruction = 9,
    #[display("unknown syscall")]
    UnknownSyscall = 10,
    #[display("multiple exception error")]
    MultipleExceptionError = 11,
    #[display("symbolic execution error")]
    SymbolicExecutionError = 12,
    #[display("out of trace memory")]
    OutOfTraceMemory = 13,
    #[display("incompleteness")]
    Incompleteness = 14,
    #[display("uncaught exception")]
    UncaughtException = 15,
    #[display("maximum path length exceeded")]
    MaxPathLength = 16,
}

impl ExitCode {
    pub const fn code(self) -> i32 {
        self as i32
    }
}

impl From<Exception> for ExitCode {
    /// An exception that reaches the host uncaught is reported using its
    /// own dedicated exit code when one exists, and `UncaughtException`
    /// otherwise (§7).
    fn from(e: Exception) -> ExitCode {
        match e {
            Exception::DivisionByZero => ExitCode::DivisionByZero,
            Exception::UnknownInstruction(_) => ExitCode::UnknownInstruction,
            Exception::MultipleException { .. } => ExitCode::MultipleExceptionError,
            Exception::MaxTrace => ExitCode::OutOfTraceMemory,
            Exception::MaxCorrection => ExitCode::OutOfTraceMemory,
            Exception::Incompleteness => ExitCode::Incompleteness,
            Exception::PageFault(_)
            | Exception::Syscall
            | Exception::Timer
            | Exception::InvalidAddress(_) => ExitCode::UncaughtException,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_error_maps_to_matching_exit_code() {
        let e = CompileError::Scanner { line: 3, message: "bad char".into() };
        assert_eq!(e.exit_code(), ExitCode::ScannerError);
        assert_eq!(e.exit_code().code(), 3);
    }

    #[test]
    fn exception_names_match_glossary() {
        assert_eq!(Exception::DivisionByZero.name(), "DIVISIONBYZERO");
        assert_eq!(Exception::Incompleteness.name(), "INCOMPLETENESS");
    }
}
