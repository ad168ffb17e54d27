
use std::fmt::{Display, Formatter};

use strum_macros::{Display as StrumDisplay, EnumString, IntoStaticStr};

use crate::registers::Register;

/**
  Mnemonics of the simulated instruction set: the RV32I base integer opcodes
  this simulator understands plus `HALT`, an engine extension that stops the
  run like the system opcodes do but is distinguished in traces.

  The serialize strings double as the display form, so uppercasing a source
  mnemonic and calling `Opcode::from_str` is the entire opcode decoder. An
  unknown mnemonic is a `strum::ParseError`, surfaced by the operand parser as
  `ParseError::UnknownMnemonic` — there is no string-keyed dispatch table to
  miss at execution time.
*/
#[derive(
StrumDisplay, IntoStaticStr, EnumString,
Clone,        Copy,          Eq, PartialEq, Debug, Hash
)]
pub enum Opcode {
  // Register-register arithmetic/logical //
  #[strum(serialize = "ADD")]       Add,
  #[strum(serialize = "SUB")]       Sub,
  #[strum(serialize = "SLT")]       Slt,
  #[strum(serialize = "SLTU")]      Sltu,
  #[strum(serialize = "XOR")]       Xor,
  #[strum(serialize = "OR")]        Or,
  #[strum(serialize = "AND")]       And,
  #[strum(serialize = "SLL")]       Sll,
  #[strum(serialize = "SRL")]       Srl,
  #[strum(serialize = "SRA")]       Sra,

  // Register-immediate //
  #[strum(serialize = "ADDI")]      Addi,
  #[strum(serialize = "ANDI")]      Andi,
  #[strum(serialize = "ORI")]       Ori,
  #[strum(serialize = "XORI")]      Xori,
  #[strum(serialize = "SLTI")]      Slti,
  #[strum(serialize = "SLTIU")]     Sltiu,
  #[strum(serialize = "SLLI")]      Slli,
  #[strum(serialize = "SRLI")]      Srli,
  #[strum(serialize = "SRAI")]      Srai,

  // Loads, `rd, offset(rs1)` //
  #[strum(serialize = "LW")]        Lw,
  #[strum(serialize = "LH")]        Lh,
  #[strum(serialize = "LHU")]       Lhu,
  #[strum(serialize = "LB")]        Lb,
  #[strum(serialize = "LBU")]       Lbu,

  // Stores, `rs2, offset(rs1)` //
  #[strum(serialize = "SW")]        Sw,
  #[strum(serialize = "SH")]        Sh,
  #[strum(serialize = "SB")]        Sb,

  // Branches, `rs1, rs2, target` //
  #[strum(serialize = "BEQ")]       Beq,
  #[strum(serialize = "BNE")]       Bne,
  #[strum(serialize = "BLT")]       Blt,
  #[strum(serialize = "BGE")]       Bge,
  #[strum(serialize = "BLTU")]      Bltu,
  #[strum(serialize = "BGEU")]      Bgeu,

  // Upper immediate //
  #[strum(serialize = "LUI")]       Lui,
  #[strum(serialize = "AUIPC")]     Auipc,

  // Jumps //
  #[strum(serialize = "JAL")]       Jal,
  #[strum(serialize = "JALR")]      Jalr,

  // System; each halts the machine //
  #[strum(serialize = "ECALL")]     Ecall,
  #[strum(serialize = "EBREAK")]    Ebreak,
  #[strum(serialize = "FENCE")]     Fence,
  #[strum(serialize = "FENCE.TSO")] FenceTso,
  #[strum(serialize = "PAUSE")]     Pause,
  #[strum(serialize = "HALT")]      Halt,
}

/// The operand shape an opcode takes, which determines how the rest of the
/// line is parsed.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum Shape {
  RegReg,
  RegImm,
  Load,
  Store,
  Branch,
  Upper,
  Jal,
  Jalr,
  System
}

impl Opcode {
  pub fn shape(&self) -> Shape {
    use Opcode::*;
    match self {
      Add | Sub | Slt | Sltu | Xor | Or | And | Sll | Srl | Sra      => Shape::RegReg,
      Addi | Andi | Ori | Xori | Slti | Sltiu | Slli | Srli | Srai   => Shape::RegImm,
      Lw | Lh | Lhu | Lb | Lbu                                       => Shape::Load,
      Sw | Sh | Sb                                                   => Shape::Store,
      Beq | Bne | Blt | Bge | Bltu | Bgeu                            => Shape::Branch,
      Lui | Auipc                                                    => Shape::Upper,
      Jal                                                            => Shape::Jal,
      Jalr                                                           => Shape::Jalr,
      Ecall | Ebreak | Fence | FenceTso | Pause | Halt               => Shape::System
    }
  }
}

/// A branch or jump destination, decided once at parse time: either a label
/// to resolve through the label table, or an absolute instruction index (the
/// numeric-target form).
#[derive(Clone, Eq, PartialEq, Debug, Hash)]
pub enum JumpTarget {
  Label(String),
  Index(usize)
}

impl Display for JumpTarget {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      JumpTarget::Label(name)  => write!(f, "{}", name),
      JumpTarget::Index(index) => write!(f, "{}", index)
    }
  }
}

/**
  Holds the decoded components of one instruction, one variant per operand
  shape. Produced by the operand parser at each fetch and discarded after the
  step; never persisted.

  Field types encode what the semantics layer may assume: register operands
  are validated `Register` indices, immediates are 32-bit words in signed
  form, and only branches and `JAL` carry a symbolic target.
*/
#[derive(Clone, Eq, PartialEq, Debug, Hash)]
pub enum Instruction {
  RegReg {
    opcode : Opcode,
    rd     : Register,
    rs1    : Register,
    rs2    : Register
  },
  RegImm {
    opcode : Opcode,
    rd     : Register,
    rs1    : Register,
    imm    : i32
  },
  /// `rd, offset(base)`
  Load {
    opcode : Opcode,
    rd     : Register,
    offset : i32,
    base   : Register
  },
  /// `rs2, offset(base)`
  Store {
    opcode : Opcode,
    rs2    : Register,
    offset : i32,
    base   : Register
  },
  Branch {
    opcode : Opcode,
    rs1    : Register,
    rs2    : Register,
    target : JumpTarget
  },
  Jal {
    rd     : Register,
    target : JumpTarget
  },
  Jalr {
    rd     : Register,
    rs1    : Register,
    imm    : i32
  },
  Upper {
    opcode : Opcode,
    rd     : Register,
    imm    : i32
  },
  System(Opcode),
}

impl Instruction {
  /// The mnemonic this instruction was decoded from.
  pub fn opcode(&self) -> Opcode {
    match self {
      Instruction::RegReg { opcode, .. } => *opcode,
      Instruction::RegImm { opcode, .. } => *opcode,
      Instruction::Load   { opcode, .. } => *opcode,
      Instruction::Store  { opcode, .. } => *opcode,
      Instruction::Branch { opcode, .. } => *opcode,
      Instruction::Jal    { .. }         => Opcode::Jal,
      Instruction::Jalr   { .. }         => Opcode::Jalr,
      Instruction::Upper  { opcode, .. } => *opcode,
      Instruction::System(opcode)        => *opcode
    }
  }
}

impl Display for Instruction {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {

      Instruction::RegReg { opcode, rd, rs1, rs2 } => {
        write!(f, "{} {}, {}, {}", opcode, rd, rs1, rs2)
      }

      Instruction::RegImm { opcode, rd, rs1, imm } => {
        write!(f, "{} {}, {}, {}", opcode, rd, rs1, imm)
      }

      Instruction::Load { opcode, rd, offset, base } => {
        write!(f, "{} {}, {}({})", opcode, rd, offset, base)
      }

      Instruction::Store { opcode, rs2, offset, base } => {
        write!(f, "{} {}, {}({})", opcode, rs2, offset, base)
      }

      Instruction::Branch { opcode, rs1, rs2, target } => {
        write!(f, "{} {}, {}, {}", opcode, rs1, rs2, target)
      }

      Instruction::Jal { rd, target } => {
        write!(f, "JAL {}, {}", rd, target)
      }

      Instruction::Jalr { rd, rs1, imm } => {
        write!(f, "JALR {}, {}, {}", rd, rs1, imm)
      }

      Instruction::Upper { opcode, rd, imm } => {
        write!(f, "{} {}, {}", opcode, rd, imm)
      }

      Instruction::System(opcode) => {
        write!(f, "{}", opcode)
      }

    }
  }
}


#[cfg(test)]
mod tests {
  use std::str::FromStr;

  use super::*;

  #[test]
  fn mnemonics_round_trip_through_strum() {
    assert_eq!(Opcode::from_str("ADD"), Ok(Opcode::Add));
    assert_eq!(Opcode::from_str("FENCE.TSO"), Ok(Opcode::FenceTso));
    assert_eq!(format!("{}", Opcode::FenceTso), "FENCE.TSO");
    assert_eq!(format!("{}", Opcode::Sltiu), "SLTIU");
    assert!(Opcode::from_str("MUL").is_err());
  }

  #[test]
  fn shapes_partition_the_opcode_set() {
    assert_eq!(Opcode::Sra.shape(), Shape::RegReg);
    assert_eq!(Opcode::Srai.shape(), Shape::RegImm);
    assert_eq!(Opcode::Lbu.shape(), Shape::Load);
    assert_eq!(Opcode::Sh.shape(), Shape::Store);
    assert_eq!(Opcode::Bgeu.shape(), Shape::Branch);
    assert_eq!(Opcode::Auipc.shape(), Shape::Upper);
    assert_eq!(Opcode::Halt.shape(), Shape::System);
  }

  #[test]
  fn display_reconstructs_canonical_text() {
    let r = |i| Register::new(i).unwrap();
    let instruction = Instruction::Load {
      opcode: Opcode::Lw, rd: r(5), offset: -8, base: r(2)
    };
    assert_eq!(format!("{}", instruction), "LW x5, -8(x2)");

    let branch = Instruction::Branch {
      opcode: Opcode::Blt, rs1: r(2), rs2: r(1),
      target: JumpTarget::Label("loop".to_string())
    };
    assert_eq!(format!("{}", branch), "BLT x2, x1, loop");
  }
}
