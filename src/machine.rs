/*!
  The execution engine: a `Machine` owns the register file, the memory, the
  assembled program, and the program counter, and drives the
  fetch-decode-execute loop until the program halts, faults, or runs off
  either end of the instruction list.

  The program counter is an *instruction index* into the executable list, not
  a byte address. Labels and numeric jump targets resolve to indices, and the
  return address stored by the jump-and-link instructions is `index + 1`.
  This is a deliberate simplification relative to byte-addressed hardware
  PCs; `AUIPC` documents the one place it shows.

  Each machine is constructed fresh for one run and shares nothing: no run
  can observe another's registers or memory.
*/

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use prettytable::{format as TableFormat, Table};
use thiserror::Error;

use crate::instruction::{Instruction, JumpTarget, Opcode};
use crate::memory::Memory;
use crate::parser::{parse_instruction, ParseError};
use crate::program::{Literal, Program};
use crate::registers::{RegisterFile, REGISTER_COUNT};

// region Status, errors, and warnings

/// Why a run stopped without fault.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HaltReason {
  Ecall,
  Ebreak,
  Fence,
  FenceTso,
  Pause,
  /// The `HALT` engine extension, distinguished from the RV32I system
  /// opcodes in traces.
  Explicit,
  /// The PC left `[0, instruction_count)` by ordinary advancement.
  RanOffEnd
}

impl Display for HaltReason {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      HaltReason::Ecall     => write!(f, "ECALL"),
      HaltReason::Ebreak    => write!(f, "EBREAK"),
      HaltReason::Fence     => write!(f, "FENCE"),
      HaltReason::FenceTso  => write!(f, "FENCE.TSO"),
      HaltReason::Pause     => write!(f, "PAUSE"),
      HaltReason::Explicit  => write!(f, "HALT"),
      HaltReason::RanOffEnd => write!(f, "PC out of range")
    }
  }
}

/// Fatal execution errors. Each carries the index of the instruction it
/// occurred at; the machine transitions to `Faulted` and never silently
/// continues past one.
#[derive(Error, Clone, Debug, Eq, PartialEq)]
pub enum ExecError {
  #[error("instruction {index} '{text}': {source}")]
  Parse {
    index  : usize,
    text   : String,
    source : ParseError
  },

  #[error("instruction {index}: unresolved label '{label}'")]
  UnresolvedLabel { index: usize, label: String },

  #[error("instruction {index}: invalid jump address {target}, program has {limit} instructions")]
  InvalidJumpTarget { index: usize, target: u32, limit: usize },

  #[error("starting index {start} is outside the program's {limit} instructions")]
  StartOutOfRange { start: usize, limit: usize },
}

/// Engine state. `Halted` and `Faulted` are terminal: further `step` calls
/// are no-ops.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Status {
  Running,
  Halted(HaltReason),
  Faulted(ExecError)
}

impl Status {
  pub fn is_running(&self) -> bool {
    match self {
      Status::Running => true,
      _               => false
    }
  }
}

impl Display for Status {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      Status::Running        => write!(f, "running"),
      Status::Halted(reason) => write!(f, "halted ({})", reason),
      Status::Faulted(error) => write!(f, "faulted: {}", error)
    }
  }
}

/// What to do with a line the operand parser rejects: fault the run, or skip
/// the line and advance the PC as the lenient mode does.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParsePolicy {
  Strict,
  Lenient
}

/// Non-fatal observable signals. Collected per step and in aggregate; never
/// abort the run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Warning {
  UninitializedRead { address: u32 },
  DiscardedZeroWrite { value: u32 },
  SkippedUnparsable { index: usize, reason: String }
}

impl Display for Warning {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      Warning::UninitializedRead { address } => {
        write!(f, "uninitialized memory read at {:#010x}", address)
      }
      Warning::DiscardedZeroWrite { value } => {
        write!(f, "discarded write of {:#010x} to x0", value)
      }
      Warning::SkippedUnparsable { index, reason } => {
        write!(f, "skipped unparsable instruction {}: {}", index, reason)
      }
    }
  }
}

// endregion

// region Snapshots

/// Snapshot handed to the per-step observer after each successfully executed
/// instruction, and recorded in the trace when trace recording is on.
#[derive(Clone, Debug)]
pub struct StepEvent {
  /// Index of the instruction that just executed.
  pub index     : usize,
  /// Its source text.
  pub text      : String,
  /// The PC after the step.
  pub pc        : usize,
  pub registers : [u32; REGISTER_COUNT],
  pub memory    : BTreeMap<u32, u8>,
  pub warnings  : Vec<Warning>
}

/// The architectural state a finished run surfaces to the caller.
#[derive(Clone, Debug)]
pub struct FinalState {
  pub registers : [u32; REGISTER_COUNT],
  pub memory    : BTreeMap<u32, u8>,
  pub status    : Status,
  /// Instructions successfully executed.
  pub steps     : usize,
  pub warnings  : Vec<Warning>,
  /// Per-step snapshots, populated when `record_trace(true)` was set.
  pub trace     : Vec<StepEvent>
}

// endregion

// region Pure semantics helpers

/// The arithmetic/logical operations shared by the register-register and
/// register-immediate forms. Everything is mod 2^32; shift amounts mask to
/// five bits; SRA propagates the sign bit.
fn alu(opcode: Opcode, a: u32, b: u32) -> u32 {
  use Opcode::*;
  match opcode {
    Add  | Addi  => a.wrapping_add(b),
    Sub          => a.wrapping_sub(b),
    And  | Andi  => a & b,
    Or   | Ori   => a | b,
    Xor  | Xori  => a ^ b,
    Slt  | Slti  => ((a as i32) < (b as i32)) as u32,
    Sltu | Sltiu => (a < b) as u32,
    Sll  | Slli  => a << (b & 0x1F),
    Srl  | Srli  => a >> (b & 0x1F),
    Sra  | Srai  => ((a as i32) >> (b & 0x1F)) as u32,
    _            => unreachable!("{} is not an arithmetic/logical operation", opcode)
  }
}

/// Whether a branch is taken, a pure function of the two operands and the
/// mnemonic's signedness.
fn branch_taken(opcode: Opcode, a: u32, b: u32) -> bool {
  use Opcode::*;
  match opcode {
    Beq  => a == b,
    Bne  => a != b,
    Blt  => (a as i32) < (b as i32),
    Bge  => (a as i32) >= (b as i32),
    Bltu => a < b,
    Bgeu => a >= b,
    _    => unreachable!("{} is not a branch", opcode)
  }
}

/// LB's extension rule: bit 7 of the loaded byte propagates upward.
fn sign_extend_byte(byte: u32) -> u32 {
  match byte & 0x80 != 0 {
    true  => byte | 0xFFFF_FF00,
    false => byte
  }
}

// endregion

pub struct Machine {

  // Architectural state //
  registers : RegisterFile,
  memory    : Memory,
  pc        : usize,

  program   : Program,
  status    : Status,

  // Run configuration //
  policy       : ParsePolicy,
  record_trace : bool,

  // Accumulated observations //
  steps    : usize,
  warnings : Vec<Warning>,
  trace    : Vec<StepEvent>

}

impl Machine {

  // region Construction and configuration

  /// A fresh machine over `program`, starting at instruction 0.
  pub fn new(program: Program) -> Machine {
    Machine::with_start(program, 0)
  }

  /// A fresh machine starting at `start`. A start outside
  /// `[0, instruction_count)` faults immediately; nothing executes.
  pub fn with_start(program: Program, start: usize) -> Machine {
    let limit = program.len();
    let status = match start < limit {
      true  => Status::Running,
      false => Status::Faulted(ExecError::StartOutOfRange { start, limit })
    };
    Machine {
      registers    : RegisterFile::new(),
      memory       : Memory::new(),
      pc           : start,
      program,
      status,
      policy       : ParsePolicy::Strict,
      record_trace : false,
      steps        : 0,
      warnings     : vec![],
      trace        : vec![]
    }
  }

  pub fn set_parse_policy(&mut self, policy: ParsePolicy) {
    self.policy = policy;
  }

  pub fn record_trace(&mut self, record: bool) {
    self.record_trace = record;
  }

  /// Applies memory-initialization cells before a run: strings expand
  /// byte-per-character from their address, characters store one byte, and
  /// numbers store a 4-byte little-endian word.
  pub fn initialize_memory(&mut self, cells: &[(u32, Literal)]) {
    for (address, literal) in cells {
      match literal {

        Literal::Str(text) => {
          for (position, character) in text.chars().enumerate() {
            self.memory.store_byte(
              address.wrapping_add(position as u32),
              character as u32
            );
          }
        }

        Literal::Char(character) => {
          self.memory.store_byte(*address, *character as u32);
        }

        Literal::Word(word) => {
          self.memory.store_word(*address, *word);
        }

      }
    }
  }

  // endregion

  // region Accessors

  pub fn status(&self) -> &Status {
    &self.status
  }

  pub fn pc(&self) -> usize {
    self.pc
  }

  pub fn registers(&self) -> &RegisterFile {
    &self.registers
  }

  pub fn memory(&self) -> &Memory {
    &self.memory
  }

  pub fn program(&self) -> &Program {
    &self.program
  }

  pub fn warnings(&self) -> &[Warning] {
    &self.warnings
  }

  // endregion

  // region Execution loop

  /// Executes one instruction: fetch by PC, parse, apply semantics, update
  /// the PC. A no-op unless the machine is `Running`.
  pub fn step(&mut self) -> &Status {
    self.step_internal(None);
    &self.status
  }

  /// Runs until the machine halts or faults and returns the final state.
  pub fn run(&mut self) -> FinalState {
    self.run_loop(None)
  }

  /// Like `run`, invoking `observer` after every successfully executed
  /// instruction. Skipped lines (lenient policy) and faulting instructions
  /// do not produce events.
  pub fn run_with_observer(
    &mut self,
    observer: &mut dyn FnMut(&StepEvent)
  ) -> FinalState {
    self.run_loop(Some(observer))
  }

  fn run_loop(&mut self, mut observer: Option<&mut dyn FnMut(&StepEvent)>) -> FinalState {
    while self.status.is_running() {
      match observer {
        Some(ref mut callback) => self.step_internal(Some(&mut **callback)),
        None                   => self.step_internal(None)
      }
      #[cfg(feature = "trace_execution")] println!("{}", self);
    }
    self.final_state()
  }

  fn final_state(&self) -> FinalState {
    FinalState {
      registers : self.registers.snapshot(),
      memory    : self.memory.snapshot(),
      status    : self.status.clone(),
      steps     : self.steps,
      warnings  : self.warnings.clone(),
      trace     : self.trace.clone()
    }
  }

  fn step_internal(&mut self, observer: Option<&mut dyn FnMut(&StepEvent)>) {
    if !self.status.is_running() {
      return;
    }

    let index = self.pc;
    let text = match self.program.line(index) {
      Some(line) => line.to_string(),
      None       => {
        self.status = Status::Halted(HaltReason::RanOffEnd);
        return;
      }
    };

    let instruction = match parse_instruction(&text) {
      Ok(instruction) => instruction,
      Err(error)      => {
        match self.policy {

          ParsePolicy::Strict => {
            self.status = Status::Faulted(ExecError::Parse { index, text, source: error });
          }

          ParsePolicy::Lenient => {
            log::warn!("skipping unparsable instruction {}: {}", index, error);
            self.warnings.push(Warning::SkippedUnparsable {
              index,
              reason: error.to_string()
            });
            self.pc += 1;
          }

        }
        return;
      }
    };

    let result = self.execute(&instruction, index);
    self.registers.enforce_zero();

    // Drain the warnings the instruction produced, faulting or not.
    let mut step_warnings = self.registers.drain_warnings();
    step_warnings.extend(self.memory.drain_warnings());
    self.warnings.extend(step_warnings.iter().cloned());

    if let Err(error) = result {
      // State mutated before the fault (e.g. JALR's link write) is retained.
      self.status = Status::Faulted(error);
      return;
    }

    self.steps += 1;

    if self.record_trace || observer.is_some() {
      let event = StepEvent {
        index,
        text,
        pc        : self.pc,
        registers : self.registers.snapshot(),
        memory    : self.memory.snapshot(),
        warnings  : step_warnings
      };
      if let Some(callback) = observer {
        callback(&event);
      }
      if self.record_trace {
        self.trace.push(event);
      }
    }
  }

  // endregion

  // region Instruction semantics

  /// Resolves a branch/jump destination to an instruction index.
  fn resolve(&self, target: &JumpTarget, index: usize) -> Result<usize, ExecError> {
    match target {
      JumpTarget::Index(destination) => Ok(*destination),
      JumpTarget::Label(name)        => {
        self.program
            .lookup(name)
            .ok_or_else(|| ExecError::UnresolvedLabel { index, label: name.clone() })
      }
    }
  }

  /// Applies one decoded instruction at `index` to the architectural state,
  /// including the PC update.
  fn execute(&mut self, instruction: &Instruction, index: usize) -> Result<(), ExecError> {
    match instruction {

      Instruction::RegReg { opcode, rd, rs1, rs2 } => {
        let a = self.registers.read(*rs1);
        let b = self.registers.read(*rs2);
        self.registers.write(*rd, alu(*opcode, a, b));
        self.pc += 1;
      }

      Instruction::RegImm { opcode, rd, rs1, imm } => {
        let a = self.registers.read(*rs1);
        self.registers.write(*rd, alu(*opcode, a, *imm as u32));
        self.pc += 1;
      }

      Instruction::Load { opcode, rd, offset, base } => {
        let address = self.registers.read(*base).wrapping_add(*offset as u32);
        let value = match opcode {
          Opcode::Lw  => self.memory.load_word(address),
          Opcode::Lh  => self.memory.load_halfword(address),
          Opcode::Lhu => self.memory.load_halfword_unsigned(address),
          Opcode::Lb  => sign_extend_byte(self.memory.load_byte(address)),
          Opcode::Lbu => self.memory.load_byte(address),
          _           => unreachable!("{} is not a load", opcode)
        };
        self.registers.write(*rd, value);
        self.pc += 1;
      }

      Instruction::Store { opcode, rs2, offset, base } => {
        let address = self.registers.read(*base).wrapping_add(*offset as u32);
        let value   = self.registers.read(*rs2);
        match opcode {
          Opcode::Sw => self.memory.store_word(address, value),
          Opcode::Sh => self.memory.store_halfword(address, value & 0xFFFF),
          Opcode::Sb => self.memory.store_byte(address, value & 0xFF),
          _          => unreachable!("{} is not a store", opcode)
        }
        self.pc += 1;
      }

      Instruction::Branch { opcode, rs1, rs2, target } => {
        let a = self.registers.read(*rs1);
        let b = self.registers.read(*rs2);
        match branch_taken(*opcode, a, b) {
          true  => { self.pc = self.resolve(target, index)?; }
          false => { self.pc += 1; }
        }
      }

      Instruction::Jal { rd, target } => {
        // The link write happens before target resolution, so an unresolved
        // label still leaves the return address behind.
        if !rd.is_zero() {
          self.registers.write(*rd, (index + 1) as u32);
        }
        self.pc = self.resolve(target, index)?;
      }

      Instruction::Jalr { rd, rs1, imm } => {
        if !rd.is_zero() {
          self.registers.write(*rd, (index + 1) as u32);
        }
        let target = self.registers.read(*rs1).wrapping_add(*imm as u32);
        let limit  = self.program.len();
        match (target as usize) < limit {
          true  => { self.pc = target as usize; }
          false => {
            return Err(ExecError::InvalidJumpTarget { index, target, limit });
          }
        }
      }

      Instruction::Upper { opcode, rd, imm } => {
        let value = match opcode {
          Opcode::Lui   => (*imm as u32) << 12,
          // AUIPC uses the pre-increment instruction index as the PC. This
          // diverges from byte-addressed hardware on purpose.
          Opcode::Auipc => (index as u32).wrapping_add((*imm as u32) << 12),
          _             => unreachable!("{} is not an upper-immediate operation", opcode)
        };
        self.registers.write(*rd, value);
        self.pc += 1;
      }

      Instruction::System(opcode) => {
        self.pc += 1;
        self.status = Status::Halted(match opcode {
          Opcode::Ecall    => HaltReason::Ecall,
          Opcode::Ebreak   => HaltReason::Ebreak,
          Opcode::Fence    => HaltReason::Fence,
          Opcode::FenceTso => HaltReason::FenceTso,
          Opcode::Pause    => HaltReason::Pause,
          Opcode::Halt     => HaltReason::Explicit,
          _                => unreachable!("{} is not a system operation", opcode)
        });
      }

    }

    Ok(())
  }

  // endregion

  // region Display methods

  fn make_program_table(&self) -> Table {
    let mut table = Table::new();
    table.set_format(*TABLE_DISPLAY_FORMAT);
    table.set_titles(row![ubr->"Index", ubl->"Instruction"]);

    for (i, line) in self.program.lines().enumerate() {
      match i == self.pc {
        true  => { table.add_row(row![r->format!("* --> [{}]", i), line]); }
        false => { table.add_row(row![r->format!("[{}]", i), line]); }
      }
    }
    table
  }

  fn make_register_table(&self) -> Table {
    let mut table = Table::new();
    table.set_format(*TABLE_DISPLAY_FORMAT);
    table.set_titles(row![ubr->"Register", ubl->"Hex", ubl->"Decimal"]);

    for (i, value) in self.registers.snapshot().iter().enumerate() {
      table.add_row(row![
        r->format!("x{}", i),
        format!("{:#010x}", value),
        r->format!("{}", *value as i32)
      ]);
    }
    table
  }

  fn make_memory_table(&self) -> Table {
    let mut table = Table::new();
    table.set_format(*TABLE_DISPLAY_FORMAT);
    table.set_titles(row![ubr->"Address", ubl->"Byte"]);

    match self.memory.is_empty() {
      true  => { table.add_row(row!["(empty)", ""]); }
      false => {
        for (address, byte) in self.memory.iter() {
          table.add_row(row![r->format!("{:#010x}", address), format!("{:#04x}", byte)]);
        }
      }
    }
    table
  }

  // endregion

}

lazy_static! {
  static ref TABLE_DISPLAY_FORMAT: TableFormat::TableFormat =
    TableFormat::FormatBuilder::new()
      .column_separator('│')
      .borders(' ')
      .separator(
        TableFormat::LinePosition::Title,
        TableFormat::LineSeparator::new('─', '┼', ' ', ' ')
      )
      .padding(1, 1)
      .build();
}

impl Display for Machine {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    let mut combined_table = table!([
      self.make_program_table(),
      self.make_register_table(),
      self.make_memory_table()
    ]);
    combined_table.set_titles(row![ub->"Program", ub->"Registers", ub->"Memory"]);
    combined_table.set_format(*TABLE_DISPLAY_FORMAT);

    write!(f, "PC: {}\tStatus: {}\n{}", self.pc, self.status, combined_table)
  }
}

/**
  The one-call entry point: assembles `source`, seeds memory from `cells`,
  and runs from `start` to completion.
*/
pub fn run_program(
  source : &str,
  cells  : &[(u32, Literal)],
  start  : usize
) -> Result<FinalState, crate::program::AssembleError> {
  let program = Program::assemble(source)?;
  let mut machine = Machine::with_start(program, start);
  machine.initialize_memory(cells);
  Ok(machine.run())
}
