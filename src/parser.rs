/*!
  The operand parser: classifies one cleaned instruction-text line by mnemonic
  and extracts typed operands, or fails with a `ParseError` naming the
  offending line and what was expected.

  Parsing happens in two stages. A `nom` tokenizer splits the line into a
  mnemonic and operand tokens (commas and whitespace both separate operands,
  as in `ADD x1, x2, x3` or `JAL done`), then the mnemonic is resolved through
  the `strum`-derived `Opcode::from_str` and the tokens are converted per the
  opcode's shape. Register tokens must match `x<0-31>`; malformed or
  out-of-range tokens are errors, never silent zeros.
*/

use std::str::FromStr;

use nom::{
  branch::alt,
  bytes::complete::take_while1,
  character::complete::{char as one_char, space0, space1},
  combinator::{all_consuming, map, opt, recognize},
  multi::separated_list,
  sequence::{delimited, pair, preceded, tuple},
  IResult
};
use thiserror::Error;

use crate::instruction::{Instruction, JumpTarget, Opcode, Shape};
use crate::registers::Register;

#[derive(Error, Clone, Debug, Eq, PartialEq)]
pub enum ParseError {
  #[error("'{mnemonic}' is not an instruction in line '{line}'")]
  UnknownMnemonic { mnemonic: String, line: String },

  #[error("{opcode} takes {expected} operands but was given {actual} in line '{line}'")]
  WrongOperandCount {
    line     : String,
    opcode   : Opcode,
    expected : &'static str,
    actual   : usize
  },

  #[error("invalid register token '{token}', expected x0 through x31")]
  InvalidRegister { token: String },

  #[error("invalid immediate '{token}'")]
  InvalidImmediate { token: String },

  #[error("invalid offset syntax '{token}', expected offset(register)")]
  InvalidOffset { token: String },

  #[error("unrecognized instruction line '{line}'")]
  MalformedLine { line: String },
}

// region Token-level parsers

fn mnemonic(input: &str) -> IResult<&str, &str> {
  // `.` admits FENCE.TSO
  take_while1(|c: char| c.is_ascii_alphanumeric() || c == '.')(input)
}

fn operand_token(input: &str) -> IResult<&str, &str> {
  take_while1(|c: char| !c.is_whitespace() && c != ',')(input)
}

fn separator(input: &str) -> IResult<&str, &str> {
  // A comma with optional surrounding space, or bare whitespace.
  alt((
    recognize(tuple((space0, one_char(','), space0))),
    space1
  ))(input)
}

fn instruction_line(input: &str) -> IResult<&str, (&str, Vec<&str>)> {
  all_consuming(delimited(
    space0,
    pair(
      mnemonic,
      map(
        opt(preceded(separator, separated_list(separator, operand_token))),
        |operands| operands.unwrap_or_default()
      )
    ),
    space0
  ))(input)
}

/// The `offset(register)` sub-grammar of load and store operands.
fn offset_operand(input: &str) -> IResult<&str, (&str, &str)> {
  all_consuming(pair(
    take_while1(|c: char| c != '('),
    delimited(
      one_char('('),
      take_while1(|c: char| c != ')'),
      one_char(')')
    )
  ))(input)
}

// endregion

// region Operand conversion

pub fn parse_register(token: &str) -> Result<Register, ParseError> {
  let invalid = || ParseError::InvalidRegister { token: token.to_string() };

  let digits =
    token.strip_prefix('x')
         .or_else(|| token.strip_prefix('X'))
         .ok_or_else(invalid)?;
  if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
    return Err(invalid());
  }
  let index = digits.parse::<u8>().map_err(|_| invalid())?;
  Register::new(index).ok_or_else(invalid)
}

/**
  Parses a decimal or `0x`-prefixed hexadecimal immediate, with an optional
  leading `-`. The result is the value reduced mod 2^32, in signed form; both
  `-1` and `0xFFFFFFFF` produce the same word.
*/
pub fn parse_immediate(token: &str) -> Result<i32, ParseError> {
  let invalid = || ParseError::InvalidImmediate { token: token.to_string() };

  let (negative, body) = match token.strip_prefix('-') {
    Some(rest) => (true, rest),
    None       => (false, token)
  };
  let magnitude = match body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
    Some(hex) => i64::from_str_radix(hex, 16).map_err(|_| invalid())?,
    None      => body.parse::<i64>().map_err(|_| invalid())?
  };

  let value = match negative {
    true  => -magnitude,
    false => magnitude
  };
  if value < -(1i64 << 31) || value > u32::max_value() as i64 {
    return Err(invalid());
  }
  Ok(value as u32 as i32)
}

/// A branch/jump destination token: a leading digit means an absolute
/// instruction index, anything else is a label resolved at execution time.
fn parse_target(token: &str) -> Result<JumpTarget, ParseError> {
  match token.chars().next() {
    Some(c) if c.is_ascii_digit() => {
      let index = parse_immediate(token)? as u32 as usize;
      Ok(JumpTarget::Index(index))
    }
    _ => Ok(JumpTarget::Label(token.to_string()))
  }
}

fn parse_offset(token: &str) -> Result<(i32, Register), ParseError> {
  match offset_operand(token) {
    Ok((_rest, (offset_text, base_text))) => {
      let offset = parse_immediate(offset_text.trim())?;
      let base   = parse_register(base_text.trim())?;
      Ok((offset, base))
    }
    Err(_) => Err(ParseError::InvalidOffset { token: token.to_string() })
  }
}

// endregion

/// Splits a cleaned line into mnemonic and operand tokens.
fn tokenize(line: &str) -> Result<(&str, Vec<&str>), ParseError> {
  match instruction_line(line) {
    Ok((_rest, parts)) => Ok(parts),
    Err(_)             => Err(ParseError::MalformedLine { line: line.to_string() })
  }
}

/**
  Parses one instruction-text line (comments and labels already stripped) into
  its decoded form. Mnemonics are case-insensitive; operand shape and count
  are dictated by the opcode.
*/
pub fn parse_instruction(line: &str) -> Result<Instruction, ParseError> {
  let (mnemonic_text, operands) = tokenize(line)?;

  let opcode =
    Opcode::from_str(mnemonic_text.to_ascii_uppercase().as_str())
      .map_err(|_| ParseError::UnknownMnemonic {
        mnemonic: mnemonic_text.to_string(),
        line: line.to_string()
      })?;

  let wrong_count = |expected: &'static str| ParseError::WrongOperandCount {
    line: line.to_string(),
    opcode,
    expected,
    actual: operands.len()
  };

  match opcode.shape() {

    Shape::RegReg => match operands.as_slice() {
      [rd, rs1, rs2] => Ok(Instruction::RegReg {
        opcode,
        rd  : parse_register(rd)?,
        rs1 : parse_register(rs1)?,
        rs2 : parse_register(rs2)?
      }),
      _ => Err(wrong_count("3"))
    },

    Shape::RegImm => match operands.as_slice() {
      [rd, rs1, imm] => Ok(Instruction::RegImm {
        opcode,
        rd  : parse_register(rd)?,
        rs1 : parse_register(rs1)?,
        imm : parse_immediate(imm)?
      }),
      _ => Err(wrong_count("3"))
    },

    Shape::Load => match operands.as_slice() {
      [rd, offset_base] => {
        let (offset, base) = parse_offset(offset_base)?;
        Ok(Instruction::Load { opcode, rd: parse_register(rd)?, offset, base })
      }
      _ => Err(wrong_count("2"))
    },

    Shape::Store => match operands.as_slice() {
      [rs2, offset_base] => {
        let (offset, base) = parse_offset(offset_base)?;
        Ok(Instruction::Store { opcode, rs2: parse_register(rs2)?, offset, base })
      }
      _ => Err(wrong_count("2"))
    },

    Shape::Branch => match operands.as_slice() {
      [rs1, rs2, target] => Ok(Instruction::Branch {
        opcode,
        rs1    : parse_register(rs1)?,
        rs2    : parse_register(rs2)?,
        target : parse_target(target)?
      }),
      _ => Err(wrong_count("3"))
    },

    Shape::Jal => match operands.as_slice() {
      // Bare `JAL target` links through x1.
      [target]     => Ok(Instruction::Jal {
        rd: Register::LINK, target: parse_target(target)?
      }),
      [rd, target] => Ok(Instruction::Jal {
        rd: parse_register(rd)?, target: parse_target(target)?
      }),
      _ => Err(wrong_count("1 or 2"))
    },

    Shape::Jalr => match operands.as_slice() {
      [rd]           => Ok(Instruction::Jalr {
        rd: parse_register(rd)?, rs1: Register::ZERO, imm: 0
      }),
      [rd, rs1]      => Ok(Instruction::Jalr {
        rd: parse_register(rd)?, rs1: parse_register(rs1)?, imm: 0
      }),
      [rd, rs1, imm] => Ok(Instruction::Jalr {
        rd  : parse_register(rd)?,
        rs1 : parse_register(rs1)?,
        imm : parse_immediate(imm)?
      }),
      _ => Err(wrong_count("1 to 3"))
    },

    Shape::Upper => match operands.as_slice() {
      [rd, imm] => Ok(Instruction::Upper {
        opcode,
        rd  : parse_register(rd)?,
        imm : parse_immediate(imm)?
      }),
      _ => Err(wrong_count("2"))
    },

    Shape::System => match operands.is_empty() {
      true  => Ok(Instruction::System(opcode)),
      false => Err(wrong_count("0"))
    }

  }
}


#[cfg(test)]
mod tests {
  use super::*;

  fn r(index: u8) -> Register {
    Register::new(index).unwrap()
  }

  #[test]
  fn parses_register_register_form() {
    assert_eq!(
      parse_instruction("ADD x3, x1, x2"),
      Ok(Instruction::RegReg { opcode: Opcode::Add, rd: r(3), rs1: r(1), rs2: r(2) })
    );
  }

  #[test]
  fn mnemonics_are_case_insensitive_and_spacing_is_loose() {
    assert_eq!(
      parse_instruction("  addi   x1 ,x0,  10  "),
      Ok(Instruction::RegImm { opcode: Opcode::Addi, rd: r(1), rs1: r(0), imm: 10 })
    );
  }

  #[test]
  fn immediates_accept_hex_and_negatives() {
    assert_eq!(
      parse_instruction("ORI x1, x0, 0xFF"),
      Ok(Instruction::RegImm { opcode: Opcode::Ori, rd: r(1), rs1: r(0), imm: 0xFF })
    );
    assert_eq!(
      parse_instruction("ADDI x4, x0, -8"),
      Ok(Instruction::RegImm { opcode: Opcode::Addi, rd: r(4), rs1: r(0), imm: -8 })
    );
    // -1 and 0xFFFFFFFF are the same 32-bit word.
    assert_eq!(parse_immediate("0xFFFFFFFF"), Ok(-1));
  }

  #[test]
  fn parses_offset_notation() {
    assert_eq!(
      parse_instruction("LW x5, -4(x2)"),
      Ok(Instruction::Load { opcode: Opcode::Lw, rd: r(5), offset: -4, base: r(2) })
    );
    assert_eq!(
      parse_instruction("SW x5, 0x10(x2)"),
      Ok(Instruction::Store { opcode: Opcode::Sw, rs2: r(5), offset: 16, base: r(2) })
    );
  }

  #[test]
  fn malformed_offsets_are_errors() {
    assert_eq!(
      parse_instruction("LW x5, 4x2)"),
      Err(ParseError::InvalidOffset { token: "4x2)".to_string() })
    );
    assert_eq!(
      parse_instruction("SW x5, 4(x2"),
      Err(ParseError::InvalidOffset { token: "4(x2".to_string() })
    );
  }

  #[test]
  fn parses_branches_with_label_and_numeric_targets() {
    assert_eq!(
      parse_instruction("BLT x2, x1, loop"),
      Ok(Instruction::Branch {
        opcode: Opcode::Blt, rs1: r(2), rs2: r(1),
        target: JumpTarget::Label("loop".to_string())
      })
    );
    assert_eq!(
      parse_instruction("BEQ x0, x0, 4"),
      Ok(Instruction::Branch {
        opcode: Opcode::Beq, rs1: r(0), rs2: r(0),
        target: JumpTarget::Index(4)
      })
    );
  }

  #[test]
  fn jal_defaults_the_link_register() {
    assert_eq!(
      parse_instruction("JAL done"),
      Ok(Instruction::Jal { rd: r(1), target: JumpTarget::Label("done".to_string()) })
    );
    assert_eq!(
      parse_instruction("JAL x5, done"),
      Ok(Instruction::Jal { rd: r(5), target: JumpTarget::Label("done".to_string()) })
    );
  }

  #[test]
  fn jalr_accepts_one_to_three_operands() {
    assert_eq!(
      parse_instruction("JALR x1"),
      Ok(Instruction::Jalr { rd: r(1), rs1: r(0), imm: 0 })
    );
    assert_eq!(
      parse_instruction("JALR x1, x2"),
      Ok(Instruction::Jalr { rd: r(1), rs1: r(2), imm: 0 })
    );
    assert_eq!(
      parse_instruction("JALR x1, x2, 8"),
      Ok(Instruction::Jalr { rd: r(1), rs1: r(2), imm: 8 })
    );
  }

  #[test]
  fn system_opcodes_take_no_operands() {
    assert_eq!(parse_instruction("ecall"), Ok(Instruction::System(Opcode::Ecall)));
    assert_eq!(parse_instruction("FENCE.TSO"), Ok(Instruction::System(Opcode::FenceTso)));
    assert_eq!(parse_instruction("HALT"), Ok(Instruction::System(Opcode::Halt)));
    assert!(matches!(
      parse_instruction("ECALL x1"),
      Err(ParseError::WrongOperandCount { expected: "0", actual: 1, .. })
    ));
  }

  #[test]
  fn bad_register_tokens_are_errors_not_zeros() {
    assert_eq!(
      parse_instruction("ADD x32, x1, x2"),
      Err(ParseError::InvalidRegister { token: "x32".to_string() })
    );
    assert_eq!(
      parse_instruction("ADD y1, x1, x2"),
      Err(ParseError::InvalidRegister { token: "y1".to_string() })
    );
    assert_eq!(
      parse_instruction("ADD x, x1, x2"),
      Err(ParseError::InvalidRegister { token: "x".to_string() })
    );
  }

  #[test]
  fn unknown_mnemonics_and_wrong_counts_are_reported() {
    assert!(matches!(
      parse_instruction("MUL x1, x2, x3"),
      Err(ParseError::UnknownMnemonic { .. })
    ));
    assert!(matches!(
      parse_instruction("ADD x1, x2"),
      Err(ParseError::WrongOperandCount { expected: "3", actual: 2, .. })
    ));
  }
}
