/*!
  An assembly-level functional simulator for a subset of the RV32I base
  integer instruction set. Programs are sequences of instruction-text lines
  (no pseudo-instructions); a two-pass label resolver produces the executable
  list and label table, and the `Machine` runs fetch-decode-execute over 32
  general-purpose registers and a sparse little-endian byte memory until the
  program halts, faults, or runs off the end.
*/

#[macro_use] extern crate prettytable;
#[macro_use] extern crate lazy_static;

pub mod instruction;
pub mod machine;
pub mod memory;
pub mod parser;
pub mod program;
pub mod registers;

pub use crate::machine::{
  run_program, ExecError, FinalState, HaltReason, Machine, ParsePolicy, Status, StepEvent,
  Warning
};
pub use crate::parser::ParseError;
pub use crate::program::{parse_memory_init, AssembleError, Literal, MemoryInitError, Program};
