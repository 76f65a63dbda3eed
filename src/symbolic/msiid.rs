//! The MSIID abstract domain (§4.8): a modular stepped integer interval
//! `{start, start+step, ..., end}` over 64-bit unsigneds. Every symbolic
//! value carried through the trace (§3 "Symbolic trace entry") is one of
//! these, a concrete value, or an array (heap block) descriptor.

use derive_more::Display;

/// An arithmetic progression `start, start+step, ..., end`. `start > end`
/// denotes a wrapped interval (the progression crosses `u64::MAX`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: u64,
    pub end: u64,
    pub step: u64,
}

impl Interval {
    pub fn singleton(value: u64) -> Self {
        Interval { start: value, end: value, step: 1 }
    }

    pub fn new(start: u64, end: u64, step: u64) -> Self {
        Interval { start, end, step }
    }

    pub fn is_singleton(&self) -> bool {
        self.start == self.end
    }

    pub fn is_wrapped(&self) -> bool {
        self.start > self.end
    }

    /// The number of steps from `start` to `end`, ignoring wrap.
    fn span(&self) -> u64 {
        self.end.wrapping_sub(self.start)
    }

    pub fn contains(&self, value: u64) -> bool {
        if self.step == 0 {
            return value == self.start;
        }
        if self.is_wrapped() {
            return (value >= self.start || value <= self.end) && (value.wrapping_sub(self.start)) % self.step == 0;
        }
        value >= self.start && value <= self.end && (value - self.start) % self.step == 0
    }

    pub fn disjoint_from(&self, other: &Interval) -> bool {
        if self.is_wrapped() || other.is_wrapped() {
            // Conservative: only claim disjointness for the common, common
            // non-wrapped case; wrapped intervals are handled explicitly by
            // the branch engine's unwrapping step (§4.10 case 4).
            return false;
        }
        self.end < other.start || other.end < self.start
    }
}

/// A correction expression connecting a node to its successor in the
/// dependence graph (§3 "Correction registers", §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Default)]
pub enum ExprKind {
    #[default]
    #[display("const")]
    Const,
    #[display("sum")]
    Sum,
    #[display("mul")]
    Mul,
    #[display("div")]
    Div,
    #[display("rem")]
    Rem,
}

/// The affine-plus-one-mul/div/rem transformation recorded alongside a
/// node's assignment, used to walk corrections backward and forward during
/// constraint propagation (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Correction {
    pub hasmn: bool,
    pub expr_kind: ExprKind,
    pub co_lo: u64,
    pub co_up: u64,
    pub lo_product: u64,
    pub factor: u64,
}

impl Correction {
    pub fn identity() -> Self {
        Correction { factor: 1, ..Correction::default() }
    }
}

/// A symbolic value: concrete, an MSIID interval, or a heap (array) block
/// (§3 "Symbolic trace entry", discriminated union per the Design Notes'
/// "Tagged variants" guidance rather than a `type` + `α1/α2/α3` triple).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    Concrete(u64),
    Interval(Interval),
    Array { base: u64, length: u64 },
}

impl Value {
    pub fn as_interval(&self) -> Interval {
        match *self {
            Value::Concrete(v) => Interval::singleton(v),
            Value::Interval(i) => i,
            Value::Array { base, .. } => Interval::singleton(base),
        }
    }
}

/// Raised when an operation cannot be kept within a single MSIID (§4.8):
/// the caller throws `Exception::Incompleteness` or, for the explicitly
/// "hard" cases, reports `SymbolicExecutionError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Incomplete;

/// `addi k`: shifts the whole progression by a constant (§4.8).
pub fn addi(a: Interval, k: i64) -> (Interval, Correction) {
    let shift = k as u64;
    let result = Interval::new(a.start.wrapping_add(shift), a.end.wrapping_add(shift), a.step);
    let correction =
        Correction { expr_kind: ExprKind::Sum, co_lo: shift, co_up: shift, factor: 1, ..Correction::default() };
    (result, correction)
}

/// `add`/`sub` of two symbolic intervals (§4.8): requires a compatible
/// step lattice (gcd test) and a non-overflowing combined span.
pub fn add(a: Interval, b: Interval) -> Result<Interval, Incomplete> {
    let step = crate::common::gcd(a.step.max(1), b.step.max(1));
    let span_a = a.span();
    let span_b = b.span();
    if span_a.checked_add(span_b).is_none() {
        return Err(Incomplete);
    }
    Ok(Interval::new(a.start.wrapping_add(b.start), a.end.wrapping_add(b.end), step))
}

pub fn sub(a: Interval, b: Interval) -> Result<Interval, Incomplete> {
    let step = crate::common::gcd(a.step.max(1), b.step.max(1));
    let span_a = a.span();
    let span_b = b.span();
    if span_a.checked_add(span_b).is_none() {
        return Err(Incomplete);
    }
    Ok(Interval::new(a.start.wrapping_sub(b.end), a.end.wrapping_sub(b.start), step))
}

/// `mul k`: scales the progression, checked against overflow of both the
/// span and the step (§4.8).
pub fn mul(a: Interval, k: u64) -> Result<(Interval, Correction), Incomplete> {
    if k == 0 {
        return Ok((Interval::singleton(0), Correction { expr_kind: ExprKind::Mul, factor: 0, ..Default::default() }));
    }
    let span = a.span().checked_mul(k).ok_or(Incomplete)?;
    let step = a.step.checked_mul(k).ok_or(Incomplete)?;
    let start = a.start.wrapping_mul(k);
    let end = start.wrapping_add(span);
    let correction =
        Correction { expr_kind: ExprKind::Mul, factor: k, lo_product: start, ..Correction::default() };
    Ok((Interval::new(start, end, step), correction))
}

/// `divu k`: the step must divide cleanly between the interval's own step
/// and `k` (§4.8); a wrapped interval is only accepted when the rounded
/// endpoints still form a single MSIID.
pub fn divu(a: Interval, k: u64) -> Result<(Interval, Correction), Incomplete> {
    if k == 0 {
        return Err(Incomplete);
    }
    if a.is_wrapped() {
        return Err(Incomplete);
    }
    if a.step % k != 0 && k % a.step.max(1) != 0 {
        return Err(Incomplete);
    }
    let start = a.start / k;
    let end = a.end / k;
    let step = (a.step / k).max(1);
    let correction = Correction { expr_kind: ExprKind::Div, factor: k, ..Correction::default() };
    Ok((Interval::new(start, end, step), correction))
}

/// `remu k`: only the "complete" cases (§4.8) where the interval doesn't
/// straddle a multiple-of-`k` boundary midway through its stride produce a
/// single resulting MSIID; everything else is `Incomplete`. A wrapped
/// input is accepted only when `k` is a power of two (§9 Open Questions:
/// "keep it explicit").
pub fn remu(a: Interval, k: u64) -> Result<(Interval, Correction), Incomplete> {
    if k == 0 {
        return Err(Incomplete);
    }
    if a.is_wrapped() && !k.is_power_of_two() {
        return Err(Incomplete);
    }
    let same_band = a.start / k == a.end / k;
    let reaches_full_cycle = a.span() >= crate::common::lcm(a.step.max(1), k).saturating_sub(a.step.max(1));
    if !same_band && !reaches_full_cycle {
        return Err(Incomplete);
    }
    let start = a.start % k;
    let end = if same_band { a.end % k } else { k - 1 };
    let step = if same_band { a.step } else { crate::common::gcd(a.step.max(1), k) };
    let correction = Correction { expr_kind: ExprKind::Rem, factor: k, ..Correction::default() };
    Ok((Interval::new(start, end, step), correction))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addi_shifts_the_progression() {
        let (result, correction) = addi(Interval::new(0, 9, 1), 5);
        assert_eq!(result, Interval::new(5, 14, 1));
        assert_eq!(correction.co_lo, 5);
    }

    #[test]
    fn mul_scales_span_and_step() {
        let (result, correction) = mul(Interval::new(0, 9, 1), 3).unwrap();
        assert_eq!(result, Interval::new(0, 27, 3));
        assert_eq!(correction.factor, 3);
    }

    #[test]
    fn mul_rejects_overflowing_span() {
        assert!(mul(Interval::new(0, u64::MAX, 1), 2).is_err());
    }

    #[test]
    fn divu_requires_a_compatible_step() {
        let (result, _) = divu(Interval::new(0, 9, 1), 2).unwrap();
        assert_eq!(result, Interval::new(0, 4, 1));
    }

    #[test]
    fn divu_rejects_zero_divisor() {
        assert!(divu(Interval::new(0, 9, 1), 0).is_err());
    }

    #[test]
    fn remu_same_band_keeps_the_stride() {
        let (result, _) = remu(Interval::new(10, 13, 1), 100).unwrap();
        assert_eq!(result, Interval::new(10, 13, 1));
    }

    #[test]
    fn disjoint_intervals_do_not_overlap() {
        assert!(Interval::new(0, 4, 1).disjoint_from(&Interval::new(5, 9, 1)));
        assert!(!Interval::new(0, 4, 1).disjoint_from(&Interval::new(4, 9, 1)));
    }
}
