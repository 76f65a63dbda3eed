//! End-to-end scenarios (§8): compile a C* source all the way to a RISC-U
//! binary and run it under the concrete interpreter, exactly the path
//! `selfie -c src -m 1` takes.

use selfie::back;
use selfie::elf::Binary;
use selfie::front::parse;
use selfie::middle::lower;
use selfie::vm::Kernel;

fn run(src: &str) -> i32 {
    let ast = parse(src).expect("source should parse");
    let (tir, _symbols) = lower(&ast).expect("source should lower");
    let buffer = back::emit(&tir).expect("source should fit the binary budget");
    let binary = Binary { code: buffer.code().to_vec(), data: buffer.data().to_vec() };
    let mut kernel = Kernel::new(0);
    let id = kernel.boot(&binary, "main");
    kernel.run(id)
}

fn run_symbolic(src: &str) -> (i32, selfie::symbolic::Summary) {
    let ast = parse(src).expect("source should parse");
    let (tir, _symbols) = lower(&ast).expect("source should lower");
    let buffer = back::emit(&tir).expect("source should fit the binary budget");
    let binary = Binary { code: buffer.code().to_vec(), data: buffer.data().to_vec() };
    let mut kernel = Kernel::new(0);
    let id = kernel.boot(&binary, "main");
    kernel.run_monster(id)
}

#[test]
fn returning_a_constant_exits_with_that_code() {
    assert_eq!(run("uint64_t main() { return 42; }"), 42);
}

#[test]
fn malloc_and_dereference_round_trips_a_value() {
    assert_eq!(run("uint64_t main() { uint64_t *p; p = malloc(8); *p = 7; return *p; }"), 7);
}

#[test]
fn a_while_loop_terminates_with_the_expected_accumulator() {
    let src = "uint64_t main() { uint64_t x; x = 0; while (x < 10) x = x + 1; return x; }";
    assert_eq!(run(src), 10);
}

#[test]
fn an_if_else_picks_the_matching_branch() {
    let src = "uint64_t main() { uint64_t x; x = 5; if (x == 5) return 1; else return 0; }";
    assert_eq!(run(src), 1);
}

#[test]
fn nested_procedure_calls_propagate_return_values() {
    let src = "uint64_t identity(uint64_t x) { return x; } uint64_t main() { return identity(99); }";
    assert_eq!(run(src), 99);
}

#[test]
fn division_by_zero_is_an_uncaught_exception_exit() {
    let src = "uint64_t main() { uint64_t z; z = 0; return 1 / z; }";
    let code = run(src);
    assert_eq!(code, selfie::error::ExitCode::DivisionByZero.code());
}

#[test]
fn symbolic_input_explores_every_branch_the_interval_can_split_into() {
    // §8 scenario 3: an `input` value drives a two-way branch, and the
    // monster loop explores both sides rather than committing to one.
    let src = "uint64_t main() { uint64_t x; x = input(0, 1, 1); if (x < 1) return 0; else return 1; }";
    let (_last, summary) = run_symbolic(src);
    assert_eq!(summary.paths_explored, 2);
    assert_eq!(summary.exit_code_range(), Some((0, 1)));
}

#[test]
fn backtracking_through_a_symbolic_divisor_finds_the_division_by_zero_path() {
    // §8 scenarios 4-5: `x` narrows to the singleton `0` down one sub-case
    // of `x < 1` and to the singleton `1` down the other, so the same
    // `divu` instruction is replayed once per path with a different
    // concrete divisor once backtracking resumes it.
    let src = "uint64_t main() { uint64_t x; uint64_t y; x = input(0, 1, 1); if (x < 1) y = 10 / x; else y = 10 / x; return y; }";
    let (_last, summary) = run_symbolic(src);
    assert_eq!(summary.paths_explored, 2);
    let (lo, hi) = summary.exit_code_range().unwrap();
    assert_eq!(lo, selfie::error::ExitCode::DivisionByZero.code());
    assert_eq!(hi, 10);
}

#[test]
fn an_undefined_procedure_compiles_to_the_bootstrapping_stub() {
    // §8 scenario 6: calling an undefined procedure is not a compile-time
    // error. It compiles to a jal into a shared stub that loads 0 into
    // a0 and falls through to exit, so the whole program exits 0.
    let src = "uint64_t main() { return undeclared_procedure(); }";
    assert_eq!(run(src), 0);
}
