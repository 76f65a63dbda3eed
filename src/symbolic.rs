//! The symbolic execution engine (§2 rows L-O, §4.7-§4.11): an interval
//! domain over RISC-U arithmetic, a reversible trace of memory writes, a
//! dependence graph for constraint propagation across aliases, and a
//! depth-first branch explorer with backtracking.
//!
//! The four pieces are kept as separate engines per the Design Notes'
//! "Global mutable state" guidance (`Trace`, `DependenceGraph`,
//! `BranchStack`/`WitnessTable` each own one concern); [`Engine`] is the
//! `Session`-level owner that the symbolic front of the interpreter drives.

pub mod branch;
pub mod graph;
pub mod msiid;
pub mod trace;

use crate::error::Exception;
use crate::isa::Register;

use branch::{fuzz, split, BranchStack, Outcome, PendingBranch, WitnessTable};
use graph::DependenceGraph;
use msiid::{Correction, Interval, Value};
use trace::Trace;

/// The fuzz factor `input`/`read` widen a freshly observed byte by
/// (§4.11): `±2^(factor-1)`.
const DEFAULT_FUZZ_FACTOR: u32 = 3;

/// Owns every piece of symbolic state for one run (§9 "Global mutable
/// state": "A single Session owns them").
#[derive(Debug, Default)]
pub struct Engine {
    pub trace: Trace,
    pub graph: DependenceGraph,
    pub witnesses: WitnessTable,
    pub branches: BranchStack,
    path_length: u64,
}

pub const MAX_PATH_LENGTH: u64 = 1 << 20;

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    /// `input(start, end, step)`: a direct MSIID constructor bypassing
    /// host I/O (§4.11).
    pub fn input(&mut self, vaddr: u64, pc: u64, start: u64, end: u64, step: u64) -> Result<Value, Exception> {
        let value = Value::Interval(Interval::new(start, end, step));
        let tc = self.trace.store(pc, vaddr, value, self.trace.mrcc)?;
        self.witnesses.record(tc, pc)?;
        Ok(value)
    }

    /// A symbolic `read`: widens the concretely-observed `byte` into an
    /// MSIID and records a witness, unless `MAX_SYMBOLIC` distinct reads
    /// have already been recorded, in which case the caller should force
    /// `CHAR_EOF` instead of calling this (§4.11).
    pub fn read(&mut self, vaddr: u64, pc: u64, byte: u64) -> Result<Value, Exception> {
        if self.witnesses.exhausted() {
            return Err(Exception::Incompleteness);
        }
        let value = fuzz(byte, DEFAULT_FUZZ_FACTOR);
        let tc = self.trace.store(pc, vaddr, value, self.trace.mrcc)?;
        self.witnesses.record(tc, pc)?;
        Ok(value)
    }

    /// Records that `dest`'s value was computed from `source` via
    /// `correction` (§4.9) and stores the resulting value into the trace.
    pub fn propagate_assignment(
        &mut self,
        pc: u64,
        dest_vaddr: u64,
        source_vaddr: Option<u64>,
        value: Value,
        correction: Correction,
    ) -> Result<(), Exception> {
        let tc = self.trace.store(pc, dest_vaddr, value, self.trace.mrcc)?;
        self.graph.assign(dest_vaddr, source_vaddr, self.trace.mrcc, tc, correction)?;
        Ok(())
    }

    /// `sltu rd, rs1, rs2` in symbolic mode (§4.10): splits the comparison
    /// into its feasible sub-case(s), pushing any non-forced outcome onto
    /// the branch stack for later exploration, and returns the value `rd`
    /// should take for the branch being followed right now (`false`,
    /// i.e. "continue straight-line"). `rs1_vaddr`/`rd_vaddr` are recorded
    /// into the pushed [`PendingBranch`] so the monster loop knows which
    /// trace cells to rewrite when it later resumes the `true` sub-case.
    pub fn constrain_sltu(
        &mut self,
        pc: u64,
        fp: u64,
        sp: u64,
        rs1: Interval,
        rs2: Interval,
        rs1_vaddr: u64,
        rd_vaddr: Option<u64>,
    ) -> Result<u64, Exception> {
        match split(rs1, rs2)? {
            Outcome::Forced(taken) => Ok(taken as u64),
            Outcome::Split { false_rs1, true_rs1 } => {
                self.branches.push(PendingBranch {
                    pc,
                    fp,
                    sp,
                    base_tc: self.trace.mrcc,
                    taken: true,
                    rs1: true_rs1,
                    rs1_vaddr,
                    rd_vaddr,
                });
                // The case being followed right now (`false`) also narrows
                // `rs1`, exactly as the deferred `true` case does; without
                // this, anything downstream that rereads `rs1` on this very
                // path would still see the pre-split interval.
                self.trace.store(pc, rs1_vaddr, Value::Interval(false_rs1), self.trace.mrcc)?;
                Ok(0)
            }
        }
    }

    /// Pops the next pending branch and rewinds the trace to its base tc,
    /// so the caller can resume execution along that sub-case (§4.10 "DFS
    /// is driven by the outer monster loop").
    pub fn backtrack(&mut self) -> Option<PendingBranch> {
        let branch = self.branches.pop()?;
        while self.trace.len() > branch.base_tc {
            self.trace.backtrack();
        }
        Some(branch)
    }

    /// Advances the path-length counter after a `TIMER` exception in
    /// symbolic mode. Returns `true` once `MAX_PATH_LENGTH` is exceeded,
    /// at which point the caller should exit with `MaxPathLength` rather
    /// than resume (§7 "TIMER -> in symbolic mode, check path_length >
    /// MAX_PATH_LENGTH and exit with MAXPATHLENGTH"). This isn't a guest
    /// `Exception` variant: the original's exceptions (§4.4) don't include
    /// one for it, since it's the *timer* handler's own bookkeeping.
    pub fn tick_path_length(&mut self) -> bool {
        self.path_length += 1;
        self.path_length > MAX_PATH_LENGTH
    }

    /// The end-of-exploration state-leak assertion (§4.10): every counter
    /// this engine tracks should be back to zero once the branch stack is
    /// drained.
    pub fn is_clean(&self) -> bool {
        self.branches.is_empty()
    }
}

/// Maps a register to its trace vaddr (§3 "`1..31` for register writes").
pub fn register_vaddr(r: Register) -> u64 {
    r.index() as u64
}

/// A human-readable summary of one symbolic run, reported at `-v >= 1`
/// (SPEC_FULL.md ambient reporting addition; no counterpart in the
/// original monster loop's stdout tracing, which this crate's logging
/// replaces per [`crate::error`]'s logging wiring).
#[derive(Debug, Clone, Default)]
pub struct Summary {
    pub paths_explored: u64,
    pub exit_codes: Vec<i32>,
    pub witnesses: Vec<(u64, u64)>,
}

impl Summary {
    pub fn record_path(&mut self, exit_code: i32, engine: &Engine) {
        self.paths_explored += 1;
        self.exit_codes.push(exit_code);
        for i in 0..engine.witnesses.len() {
            let w = engine.witnesses.get(i);
            self.witnesses.push((w.origin_tc as u64, w.current_tc as u64));
        }
    }

    /// The exit-code interval across every explored path (§8 scenario 3:
    /// "reports exit code interval <0,1,1>").
    pub fn exit_code_range(&self) -> Option<(i32, i32)> {
        let lo = *self.exit_codes.iter().min()?;
        let hi = *self.exit_codes.iter().max()?;
        Some((lo, hi))
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} path(s) explored", self.paths_explored)?;
        if let Some((lo, hi)) = self.exit_code_range() {
            write!(f, ", exit code in [{lo}, {hi}]")?;
        }
        write!(f, ", {} witness(es)", self.witnesses.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_registers_a_witness() {
        let mut engine = Engine::new();
        engine.input(40, 0x10000, 0, 9, 1).unwrap();
        assert_eq!(engine.witnesses.len(), 1);
    }

    #[test]
    fn a_forced_branch_pushes_nothing() {
        let mut engine = Engine::new();
        let taken = engine
            .constrain_sltu(0x10000, 0, 0, Interval::new(0, 4, 1), Interval::new(5, 9, 1), 40, Some(41))
            .unwrap();
        assert_eq!(taken, 1);
        assert!(engine.branches.is_empty());
    }

    #[test]
    fn a_real_split_pushes_a_pending_branch() {
        let mut engine = Engine::new();
        engine.input(40, 0x10000, 0, 9, 1).unwrap();
        let x = Interval::new(0, 9, 1);
        let five = Interval::singleton(5);
        engine.constrain_sltu(0x10004, 0, 0, x, five, 40, Some(41)).unwrap();
        assert_eq!(engine.branches.len(), 1);
    }

    #[test]
    fn backtracking_rewinds_the_trace_to_the_branch_base() {
        let mut engine = Engine::new();
        engine.input(40, 0x10000, 0, 9, 1).unwrap();
        let before = engine.trace.len();
        engine
            .constrain_sltu(0x10004, 0, 0, Interval::new(0, 9, 1), Interval::singleton(5), 40, Some(41))
            .unwrap();
        engine.propagate_assignment(0x10008, 48, Some(40), Value::Concrete(3), Correction::identity()).unwrap();
        let branch = engine.backtrack().unwrap();
        assert_eq!(engine.trace.len(), before);
        assert!(branch.taken);
        assert_eq!(branch.rs1_vaddr, 40);
        assert_eq!(branch.rd_vaddr, Some(41));
    }

    #[test]
    fn summary_reports_the_exit_code_range() {
        let mut summary = Summary::default();
        let engine = Engine::new();
        summary.record_path(0, &engine);
        summary.record_path(1, &engine);
        assert_eq!(summary.exit_code_range(), Some((0, 1)));
    }
}
