/*!
  Program preparation: the label resolver that turns raw assembly source into
  an executable instruction list plus a label table, and the parser for the
  memory-initialization text that seeds the byte map before a run.

  Label addresses are instruction *indices* into the filtered executable list,
  not source line numbers and not byte offsets. A label names the instruction
  that follows it in program order, so consecutive labels alias the same
  index. Duplicate definitions of one name are rejected before execution
  begins rather than silently overwritten.
*/

use std::collections::HashMap;

use nom::{
  branch::alt,
  bytes::complete::{is_not, take_while1},
  character::complete::{anychar, char as one_char, space0},
  combinator::{all_consuming, map, map_res, opt, recognize},
  sequence::{delimited, pair, separated_pair, tuple},
  IResult
};
use thiserror::Error;

use crate::parser::parse_immediate;

#[derive(Error, Clone, Debug, Eq, PartialEq)]
pub enum AssembleError {
  #[error("duplicate label '{name}': defined for instruction {first}, redefined for instruction {second}")]
  DuplicateLabel { name: String, first: usize, second: usize },

  #[error("empty label name on source line {line}")]
  EmptyLabel { line: usize },
}

#[derive(Error, Clone, Debug, Eq, PartialEq)]
pub enum MemoryInitError {
  #[error("unrecognized memory-initialization line {line}: '{text}'")]
  MalformedLine { line: usize, text: String },

  #[error("invalid address '{token}' on memory-initialization line {line}")]
  InvalidAddress { token: String, line: usize },
}

/// Everything after a `#` is commentary.
fn strip_comment(line: &str) -> &str {
  match line.find('#') {
    Some(position) => line[..position].trim(),
    None           => line.trim()
  }
}

/**
  An assembled program: the executable instruction lines with labels, blanks,
  and comments removed, and the table mapping each label to the index of the
  instruction that follows it. Immutable once built.
*/
pub struct Program {
  lines  : Vec<String>,
  labels : HashMap<String, usize>
}

impl Program {

  /**
    The first pass over raw source: strips comments and blank lines, records
    `name:` lines as `label -> next instruction index`, and collects the rest
    as the executable stream.
  */
  pub fn assemble(source: &str) -> Result<Program, AssembleError> {
    let mut lines: Vec<String>          = vec![];
    let mut labels: HashMap<String, usize> = HashMap::new();

    for (line_number, raw_line) in source.lines().enumerate() {
      let stripped = strip_comment(raw_line);
      if stripped.is_empty() {
        continue;
      }

      match stripped.strip_suffix(':') {

        Some(label) => {
          let name = label.trim();
          if name.is_empty() {
            return Err(AssembleError::EmptyLabel { line: line_number + 1 });
          }
          let target = lines.len();
          if let Some(&first) = labels.get(name) {
            return Err(AssembleError::DuplicateLabel {
              name: name.to_string(),
              first,
              second: target
            });
          }
          labels.insert(name.to_string(), target);
        }

        None => {
          lines.push(stripped.to_string());
        }

      }
    }

    Ok(Program { lines, labels })
  }

  pub fn len(&self) -> usize {
    self.lines.len()
  }

  pub fn is_empty(&self) -> bool {
    self.lines.is_empty()
  }

  /// The instruction text at `index`, if the index is in range.
  pub fn line(&self, index: usize) -> Option<&str> {
    self.lines.get(index).map(String::as_str)
  }

  /// Resolves a label to its instruction index.
  pub fn lookup(&self, name: &str) -> Option<usize> {
    self.labels.get(name).copied()
  }

  pub fn labels(&self) -> &HashMap<String, usize> {
    &self.labels
  }

  pub fn lines(&self) -> impl Iterator<Item = &str> {
    self.lines.iter().map(String::as_str)
  }
}

// region Memory-initialization literals

/// One initializer value: a string stored byte-per-character from its
/// address, a single character byte, or a numeric 4-byte little-endian word.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Literal {
  Str(String),
  Char(char),
  Word(u32)
}

fn numeric_token(input: &str) -> IResult<&str, &str> {
  recognize(pair(
    opt(one_char('-')),
    take_while1(|c: char| c.is_ascii_alphanumeric())
  ))(input)
}

fn string_literal(input: &str) -> IResult<&str, Literal> {
  map(
    delimited(one_char('"'), opt(is_not("\"")), one_char('"')),
    |body: Option<&str>| Literal::Str(body.unwrap_or("").to_string())
  )(input)
}

fn char_literal(input: &str) -> IResult<&str, Literal> {
  map(
    delimited(one_char('\''), anychar, one_char('\'')),
    Literal::Char
  )(input)
}

fn word_literal(input: &str) -> IResult<&str, Literal> {
  map_res(
    numeric_token,
    |token: &str| parse_immediate(token).map(|value| Literal::Word(value as u32))
  )(input)
}

/// One line of the grammar: `address , value`.
fn init_line(input: &str) -> IResult<&str, (&str, Literal)> {
  all_consuming(delimited(
    space0,
    separated_pair(
      numeric_token,
      tuple((space0, one_char(','), space0)),
      alt((string_literal, char_literal, word_literal))
    ),
    space0
  ))(input)
}

/**
  Parses memory-initialization text into `(address, literal)` pairs. One pair
  per line, `#` comments and blank lines ignored; addresses and numeric values
  accept decimal or `0x` hexadecimal.
*/
pub fn parse_memory_init(text: &str) -> Result<Vec<(u32, Literal)>, MemoryInitError> {
  let mut cells = vec![];

  for (line_number, raw_line) in text.lines().enumerate() {
    let stripped = strip_comment(raw_line);
    if stripped.is_empty() {
      continue;
    }

    match init_line(stripped) {

      Ok((_rest, (address_token, literal))) => {
        // Addresses are unsigned; a leading `-` is not an address.
        let address = match address_token.starts_with('-') {
          false => parse_immediate(address_token).ok(),
          true  => None
        };
        match address {
          Some(address) => cells.push((address as u32, literal)),
          None          => {
            return Err(MemoryInitError::InvalidAddress {
              token: address_token.to_string(),
              line: line_number + 1
            });
          }
        }
      }

      Err(_) => {
        return Err(MemoryInitError::MalformedLine {
          line: line_number + 1,
          text: stripped.to_string()
        });
      }

    }
  }

  Ok(cells)
}

// endregion


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn labels_map_to_filtered_instruction_indices() {
    let source = "
      ADDI x1, x0, 1   # first executable line, index 0
      ADDI x2, x0, 1
      loop:
      ADD x3, x3, x1
      ADDI x2, x2, 1
      BLT x2, x1, loop
    ";
    let program = Program::assemble(source).unwrap();
    assert_eq!(program.len(), 5);
    assert_eq!(program.lookup("loop"), Some(2));
    assert_eq!(program.line(2), Some("ADD x3, x3, x1"));
  }

  #[test]
  fn comments_and_blank_lines_are_filtered() {
    let source = "# full-line comment\n\n   \nADDI x1, x0, 1  # trailing comment\n";
    let program = Program::assemble(source).unwrap();
    assert_eq!(program.len(), 1);
    assert_eq!(program.line(0), Some("ADDI x1, x0, 1"));
  }

  #[test]
  fn trailing_label_points_past_the_last_instruction() {
    let program = Program::assemble("ADDI x1, x0, 1\nend:\n").unwrap();
    assert_eq!(program.lookup("end"), Some(1));
    assert_eq!(program.len(), 1);
  }

  #[test]
  fn adjacent_labels_share_a_target() {
    let program = Program::assemble("a:\nb:\nADDI x1, x0, 1").unwrap();
    assert_eq!(program.lookup("a"), Some(0));
    assert_eq!(program.lookup("b"), Some(0));
  }

  #[test]
  fn duplicate_labels_are_rejected() {
    let result = Program::assemble("x:\nADDI x1, x0, 1\nx:\nADDI x2, x0, 2");
    assert_eq!(
      result.err(),
      Some(AssembleError::DuplicateLabel { name: "x".to_string(), first: 0, second: 1 })
    );
  }

  #[test]
  fn label_names_are_case_sensitive() {
    let program = Program::assemble("Loop:\nloop:\nADDI x1, x0, 1").unwrap();
    assert_eq!(program.lookup("Loop"), Some(0));
    assert_eq!(program.lookup("loop"), Some(0));
    assert_eq!(program.lookup("LOOP"), None);
  }

  #[test]
  fn empty_label_names_are_rejected() {
    assert_eq!(
      Program::assemble("ADDI x1, x0, 1\n  :\n").err(),
      Some(AssembleError::EmptyLabel { line: 2 })
    );
  }

  #[test]
  fn memory_init_accepts_all_three_literal_forms() {
    let text = "
      # seed data
      0x100, \"Hi\"
      0x200, 'A'
      512, 0xDEADBEEF
      516, -1
    ";
    assert_eq!(
      parse_memory_init(text).unwrap(),
      vec![
        (0x100, Literal::Str("Hi".to_string())),
        (0x200, Literal::Char('A')),
        (512,   Literal::Word(0xDEAD_BEEF)),
        (516,   Literal::Word(0xFFFF_FFFF)),
      ]
    );
  }

  #[test]
  fn memory_init_rejects_garbage() {
    assert!(matches!(
      parse_memory_init("0x100 \"no comma\""),
      Err(MemoryInitError::MalformedLine { line: 1, .. })
    ));
    assert!(matches!(
      parse_memory_init("-4, 7"),
      Err(MemoryInitError::InvalidAddress { line: 1, .. })
    ));
  }
}
