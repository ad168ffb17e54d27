use rv32sim::machine::{Machine, StepEvent};
use rv32sim::program::{parse_memory_init, Program};

fn main() {

  let source = "
# Sum the integers n, n-1, .., 1, spill the total, then peek at the greeting
# that memory initialization planted at 0x100.

ADDI x1, x0, 5          # n
ADDI x2, x0, 0          # accumulator
loop:
    ADD   x2, x2, x1
    ADDI  x1, x1, -1
  BLT x0, x1, loop      # while 0 < n

 SW x2,  0x40(x0)       # spill the sum

ADDI x3, x0, 0x100
LB   x4, 0(x3)          # 'H'
ecall
";

  let memory_text = "
# address, value
0x100, \"Hi\"
0x200, 'q'
0x300, 0xDEADBEEF
";

  let program = match Program::assemble(source) {
    Ok(program) => program,
    Err(error)  => {
      eprintln!("assembly failed: {}", error);
      return;
    }
  };

  let cells = match parse_memory_init(memory_text) {
    Ok(cells)  => cells,
    Err(error) => {
      eprintln!("memory initialization failed: {}", error);
      return;
    }
  };

  let mut machine = Machine::new(program);
  machine.initialize_memory(&cells);

  let state = machine.run_with_observer(&mut |event: &StepEvent| {
    println!("[{}] {}  ->  PC {}", event.index, event.text, event.pc);
    for warning in &event.warnings {
      println!("      warning: {}", warning);
    }
  });

  println!("\nFinal state:\n{}", machine);
  println!("Executed {} instructions; {}", state.steps, state.status);
}
