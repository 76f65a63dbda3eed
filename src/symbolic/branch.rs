//! The branch engine (§4.10): `sltu` in symbolic mode splits into up to
//! two sub-cases, each recorded as a pending choice so the outer "monster"
//! loop can explore it depth-first and backtrack into the next one when a
//! context exits.

use crate::error::Exception;

use super::msiid::{Interval, Value};
use super::trace::Tc;

/// One of the (at most two) outcomes a symbolic `sltu` can split into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Only one side of the comparison is reachable; `rd` is concrete.
    Forced(bool),
    /// Both sides are reachable: `rs1' `/`rs2'` hold the refined interval
    /// for the `false` case, and the `true` case is the other branch.
    Split { false_rs1: Interval, true_rs1: Interval },
}

/// Rollback data recorded for a pending sub-case (§4.10 "records, for
/// rollback: the new rd value, fp, and sp"). `rs1_vaddr`/`rd_vaddr` name
/// the trace cells the caller must rewrite on resume: `rs1_vaddr` gets the
/// narrowed `rs1` interval, `rd_vaddr` (absent when `rd` is `x0`) gets the
/// concrete `1` the comparison should now yield.
#[derive(Debug, Clone, Copy)]
pub struct PendingBranch {
    pub pc: u64,
    pub fp: u64,
    pub sp: u64,
    pub base_tc: Tc,
    pub taken: bool,
    pub rs1: Interval,
    pub rs1_vaddr: u64,
    pub rd_vaddr: Option<u64>,
}

/// Splits `rs1 < rs2` into its sub-cases (§4.10, cases 1-3; case 4's
/// wrapped-interval unwrapping is handled by the caller, which calls this
/// twice with the unwrapped linear pieces).
pub fn split(rs1: Interval, rs2: Interval) -> Result<Outcome, Exception> {
    if rs1.disjoint_from(&rs2) {
        return Ok(Outcome::Forced(rs1.end < rs2.start));
    }
    if rs1.is_singleton() {
        let v = rs1.start;
        return Ok(Outcome::Split {
            false_rs1: Interval::new(v.max(rs2.start), v, 1),
            true_rs1: Interval::new(v, v.min(rs2.end.wrapping_sub(1)), 1),
        });
    }
    if rs2.is_singleton() {
        let v = rs2.start;
        return Ok(Outcome::Split {
            false_rs1: Interval::new(v, rs1.end, 1),
            true_rs1: Interval::new(rs1.start, v.saturating_sub(1), 1),
        });
    }
    // Two non-singleton, intersecting intervals: §4.10 case 3.
    Err(Exception::Incompleteness)
}

/// The depth-first explorer (§4.10 "the outer monster loop"): a plain
/// stack of not-yet-taken branches, since backtracking is iteration, not
/// recursion (§9).
#[derive(Debug, Default)]
pub struct BranchStack {
    pending: Vec<PendingBranch>,
}

impl BranchStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, branch: PendingBranch) {
        self.pending.push(branch);
    }

    /// Pops the next branch to explore, or `None` when exploration is
    /// complete (§4.10 "when pc reaches 0 during rewind").
    pub fn pop(&mut self) -> Option<PendingBranch> {
        self.pending.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

/// A recorded witness (§3 "Witness table"): the read/input call that
/// produced a symbolic head, its current refined trace index, and the pc
/// of the syscall that produced it.
#[derive(Debug, Clone, Copy)]
pub struct Witness {
    pub origin_tc: Tc,
    pub current_tc: Tc,
    pub syscall_pc: u64,
}

pub const MAX_SYMBOLIC: usize = 1 << 12;

#[derive(Debug, Default)]
pub struct WitnessTable {
    witnesses: Vec<Witness>,
}

impl WitnessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, origin_tc: Tc, syscall_pc: u64) -> Result<usize, Exception> {
        if self.witnesses.len() >= MAX_SYMBOLIC {
            return Err(Exception::Incompleteness);
        }
        self.witnesses.push(Witness { origin_tc, current_tc: origin_tc, syscall_pc });
        Ok(self.witnesses.len() - 1)
    }

    pub fn refine(&mut self, index: usize, current_tc: Tc) {
        self.witnesses[index].current_tc = current_tc;
    }

    pub fn get(&self, index: usize) -> &Witness {
        &self.witnesses[index]
    }

    pub fn len(&self) -> usize {
        self.witnesses.len()
    }

    /// Forces `input`/`read` to `CHAR_EOF`-equivalent once `MAX_SYMBOLIC`
    /// distinct reads have been recorded (§4.11).
    pub fn exhausted(&self) -> bool {
        self.witnesses.len() >= MAX_SYMBOLIC
    }
}

/// Widens a concretely-read byte `v` into the fuzzed MSIID `read` produces
/// in symbolic mode (§4.11): `[fuzz_lo(v), fuzz_up(v)]` with the fuzz
/// factor widening to `±2^(f-1)`.
pub fn fuzz(value: u64, factor: u32) -> Value {
    if factor == 0 {
        return Value::Concrete(value);
    }
    let half = crate::common::two_to_the_power_of(factor - 1);
    let lo = value.saturating_sub(half);
    let hi = value.saturating_add(half);
    Value::Interval(Interval::new(lo, hi, 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disjoint_intervals_force_one_branch() {
        let outcome = split(Interval::new(0, 4, 1), Interval::new(5, 9, 1)).unwrap();
        assert_eq!(outcome, Outcome::Forced(true));
    }

    #[test]
    fn a_singleton_rhs_splits_the_lhs_interval() {
        let outcome = split(Interval::new(0, 9, 1), Interval::new(5, 5, 1)).unwrap();
        match outcome {
            Outcome::Split { false_rs1, true_rs1 } => {
                assert_eq!(false_rs1, Interval::new(5, 9, 1));
                assert_eq!(true_rs1, Interval::new(0, 4, 1));
            }
            _ => panic!("expected a split"),
        }
    }

    #[test]
    fn two_wide_intersecting_intervals_are_incomplete() {
        let result = split(Interval::new(0, 9, 1), Interval::new(5, 14, 1));
        assert_eq!(result, Err(Exception::Incompleteness));
    }

    #[test]
    fn fuzzing_a_zero_factor_stays_concrete() {
        assert_eq!(fuzz(7, 0), Value::Concrete(7));
    }

    #[test]
    fn fuzzing_widens_around_the_value() {
        assert_eq!(fuzz(10, 1), Value::Interval(Interval::new(9, 11, 1)));
    }

    #[test]
    fn branch_stack_pops_in_lifo_order() {
        let mut stack = BranchStack::new();
        stack.push(PendingBranch {
            pc: 1,
            fp: 0,
            sp: 0,
            base_tc: 0,
            taken: false,
            rs1: Interval::singleton(0),
            rs1_vaddr: 10,
            rd_vaddr: Some(11),
        });
        stack.push(PendingBranch {
            pc: 2,
            fp: 0,
            sp: 0,
            base_tc: 0,
            taken: true,
            rs1: Interval::singleton(1),
            rs1_vaddr: 12,
            rd_vaddr: None,
        });
        assert_eq!(stack.pop().unwrap().pc, 2);
        assert_eq!(stack.pop().unwrap().pc, 1);
        assert!(stack.is_empty());
    }
}
