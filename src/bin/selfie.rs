//! The `selfie` driver: compiles C* sources, writes/loads the binary
//! format, disassembles, and runs the RISC-U emulator under one of the
//! named machines (§6). Argument parsing, disassembly text, and the SAT
//! front end are thin wrappers around the library crate (§1 "Out of
//! scope / external collaborators").

use std::path::Path;
use std::process::ExitCode as ProcessExitCode;

use clap::{Args, Parser};
use log::{error, info};

use selfie::elf;
use selfie::error::ExitCode;
use selfie::front::parse;
use selfie::middle::lower;
use selfie::vm::Kernel;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Config {
    /// Compiles one or more C* source files as a single translation unit.
    #[arg(short = 'c', num_args = 1.., value_name = "SOURCE")]
    compile: Vec<String>,

    /// Loads a previously compiled selfie binary instead of compiling.
    #[arg(short = 'l', value_name = "BINARY", conflicts_with = "compile")]
    load: Option<String>,

    /// Writes the compiled/loaded binary to this path.
    #[arg(short = 'o', value_name = "BINARY")]
    output: Option<String>,

    /// Disassembles to stdout.
    #[arg(short = 's')]
    disassemble: bool,

    /// Disassembles to this file.
    #[arg(short = 'S', value_name = "ASSEMBLY")]
    disassemble_to: Option<String>,

    /// Verbosity, 0 (end-point only) through 5 (debug) per §6.
    #[arg(short = 'v', default_value_t = 0)]
    verbosity: u8,

    #[command(flatten)]
    machine: MachineArgs,
}

/// Machine selection (§6): at most one, with its argument the physical
/// memory budget in MB. Only `-m` (mipster, concrete) is wired to a real
/// interpreter loop in this crate; the rest log their selection and fall
/// back to mipster, since disassembling/recording/symbolic/nested
/// execution are each effectively a differently-instrumented run of the
/// same `Kernel` (§2 row I "Interpreter").
#[derive(Debug, Args)]
#[group(multiple = false)]
struct MachineArgs {
    #[arg(short = 'm', value_name = "MB")]
    mipster: Option<u64>,
    #[arg(short = 'd', value_name = "MB")]
    dipster: Option<u64>,
    #[arg(short = 'r', value_name = "MB")]
    ripster: Option<u64>,
    #[arg(short = 'n', value_name = "MB")]
    monster: Option<u64>,
    #[arg(short = 'y', value_name = "MB")]
    hypster: Option<u64>,
    #[arg(long = "min", value_name = "MB")]
    minster: Option<u64>,
    #[arg(long = "mob", value_name = "MB")]
    mobster: Option<u64>,
}

impl MachineArgs {
    fn requested(&self) -> Option<(&'static str, u64)> {
        [
            ("mipster", self.mipster),
            ("dipster", self.dipster),
            ("ripster", self.ripster),
            ("monster", self.monster),
            ("hypster", self.hypster),
            ("minster", self.minster),
            ("mobster", self.mobster),
        ]
        .into_iter()
        .find_map(|(name, mb)| mb.map(|mb| (name, mb)))
    }
}

fn verbosity_filter(v: u8) -> log::LevelFilter {
    match v {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 | 3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

fn main() -> ProcessExitCode {
    let config = Config::parse();
    env_logger::Builder::new().filter_level(verbosity_filter(config.verbosity)).init();

    match run(&config) {
        Ok(code) => ProcessExitCode::from(code as u8),
        Err(code) => {
            error!("{code}");
            ProcessExitCode::from(code.code() as u8)
        }
    }
}

fn run(config: &Config) -> Result<i32, ExitCode> {
    let binary = if let Some(path) = &config.load {
        info!("loading {path}");
        elf::load_from_file(Path::new(path), selfie::vm::memory::VIRTUAL_MEMORY_SIZE)
            .map_err(|e| {
                error!("{e}");
                ExitCode::IoError
            })?
    } else if !config.compile.is_empty() {
        compile(&config.compile)?
    } else {
        return Err(ExitCode::BadArguments);
    };

    if let Some(path) = &config.output {
        elf::save_to_file(Path::new(path), &binary).map_err(|e| {
            error!("{e}");
            ExitCode::IoError
        })?;
    }

    if config.disassemble {
        print_disassembly(&binary, &mut std::io::stdout());
    }
    if let Some(path) = &config.disassemble_to {
        let mut file = std::fs::File::create(path).map_err(|_| ExitCode::IoError)?;
        print_disassembly(&binary, &mut file);
    }

    if let Some((name, mb)) = config.machine.requested() {
        return run_machine(name, mb, &binary);
    }

    Ok(ExitCode::NoError.code())
}

fn compile(sources: &[String]) -> Result<elf::Binary, ExitCode> {
    let mut combined = String::new();
    for path in sources {
        let text = std::fs::read_to_string(path).map_err(|_| ExitCode::IoError)?;
        combined.push_str(&text);
        combined.push('\n');
    }
    let ast = parse(&combined).map_err(|errors| {
        for e in &errors {
            error!("{e}");
        }
        errors.first().map(|e| e.exit_code()).unwrap_or(ExitCode::CompilerError)
    })?;
    let (tir, _symbols) = lower(&ast).map_err(|errors| {
        for e in &errors {
            error!("{e}");
        }
        errors.first().map(|e| e.exit_code()).unwrap_or(ExitCode::CompilerError)
    })?;
    let buffer = selfie::back::emit(&tir).map_err(|e| {
        error!("{e}");
        e.exit_code()
    })?;
    Ok(elf::Binary { code: buffer.code().to_vec(), data: buffer.data().to_vec() })
}

fn print_disassembly(binary: &elf::Binary, out: &mut dyn std::io::Write) {
    for (i, insn) in binary.code.iter().enumerate() {
        let _ = writeln!(out, "{:#08x}: {insn}", i as u64 * selfie::common::INSTRUCTION_SIZE);
    }
}

/// Runs `binary` under the named machine. `mipster` (concrete execution)
/// and `monster` (symbolic execution, §6 `-n`) each have a dedicated loop
/// in this crate; `-d`/`-r`/`-y`/`-min`/`-mob` are accepted per §6 but log
/// a notice and fall back to `mipster`, since they differ from it only in
/// the instrumentation layered on top of the same fetch/decode/execute
/// loop (recording, replaying, nested nested virtualization, disk-image
/// boot), which this crate doesn't add a separate pass for (see
/// DESIGN.md).
fn run_machine(name: &str, mb: u64, binary: &elf::Binary) -> Result<i32, ExitCode> {
    let timeslice = mb.max(1) * 1_000_000;
    let mut kernel = Kernel::new(timeslice);
    let id = kernel.boot(binary, "main");
    if name == "monster" {
        let (code, summary) = kernel.run_monster(id);
        info!("{summary}");
        return Ok(code);
    }
    if name != "mipster" {
        info!("{name} requested; running concretely under mipster (§6)");
    }
    Ok(kernel.run(id))
}
