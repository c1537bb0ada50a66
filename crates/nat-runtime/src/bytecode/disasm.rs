//! Human-readable chunk dumps. Diagnostic output only; the format is not a
//! stable interface.

use std::fmt::Write;

use crate::bytecode::{Chunk, Opcode, Operands};
use crate::memory::Heap;
use crate::value::display_value;

/// Disassemble a whole chunk under a heading.
pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {name} ==");

    let mut offset = 0;
    while offset < chunk.count() {
        offset = disassemble_instruction(heap, chunk, offset, &mut out);
    }
    out
}

/// Disassemble one instruction, returning the offset of the next.
pub fn disassemble_instruction(
    heap: &Heap,
    chunk: &Chunk,
    offset: usize,
    out: &mut String,
) -> usize {
    let _ = write!(out, "{offset:04} ");
    if offset > 0 && chunk.line(offset) == chunk.line(offset - 1) {
        let _ = write!(out, "   | ");
    } else {
        let _ = write!(out, "{:4} ", chunk.line(offset));
    }

    let byte = chunk.byte(offset);
    let Some(op) = Opcode::from_byte(byte) else {
        let _ = writeln!(out, "Unknown opcode {byte}");
        return offset + 1;
    };

    match op.operands() {
        Operands::None => {
            let _ = writeln!(out, "{}", op.name());
            offset + 1
        }
        Operands::Byte => {
            let _ = writeln!(out, "{:<16} {:4}", op.name(), chunk.byte(offset + 1));
            offset + 2
        }
        Operands::Short => {
            let _ = writeln!(out, "{:<16} {}", op.name(), chunk.short(offset + 1));
            offset + 3
        }
        Operands::Jump => {
            let jump = chunk.short(offset + 1) as usize;
            let target = if op == Opcode::Loop {
                offset + 3 - jump
            } else {
                offset + 3 + jump
            };
            let _ = writeln!(out, "{:<16} {offset:4} -> {target}", op.name());
            offset + 3
        }
        Operands::Constant => {
            let constant = chunk.short(offset + 1);
            let value = chunk.constants[constant as usize];
            let _ = writeln!(
                out,
                "{:<16} {constant} '{}'",
                op.name(),
                display_value(heap, value)
            );
            offset + 3
        }
        Operands::Invoke => {
            let constant = chunk.short(offset + 1);
            let arg_count = chunk.byte(offset + 3);
            let value = chunk.constants[constant as usize];
            let _ = writeln!(
                out,
                "{:<16} ({arg_count} args) {constant:4} '{}'",
                op.name(),
                display_value(heap, value)
            );
            offset + 4
        }
        Operands::Closure => {
            let constant = chunk.short(offset + 1);
            let mut offset = offset + 3;

            let value = chunk.constants[constant as usize];
            let _ = writeln!(
                out,
                "{:<16} {constant:4} {}",
                op.name(),
                display_value(heap, value)
            );

            let upvalue_count = value
                .as_obj()
                .map(|r| heap.function(r).upvalue_count)
                .unwrap_or(0);
            for _ in 0..upvalue_count {
                let is_local = chunk.byte(offset);
                let index = chunk.byte(offset + 1);
                offset += 2;
                let _ = writeln!(
                    out,
                    "{:04}      |                     {} {index}",
                    offset - 2,
                    if is_local == 1 { "local" } else { "upvalue" }
                );
            }

            offset
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Chunk;
    use crate::value::Value;

    #[test]
    fn simple_and_operand_instructions() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        chunk.write(Opcode::Nil as u8, 1);
        chunk.write(Opcode::Pop as u8, 1);

        insta::assert_snapshot!(disassemble_chunk(&heap, &chunk, "test"), @r###"
        == test ==
        0000    1 OP_NIL
        0001    | OP_POP
        "###);
    }

    #[test]
    fn constants_render_their_value() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        let constant = chunk.add_constant(Value::Number(7.0)) as u16;
        chunk.write(Opcode::Constant as u8, 3);
        chunk.write((constant >> 8) as u8, 3);
        chunk.write((constant & 0xff) as u8, 3);
        chunk.write(Opcode::Print as u8, 4);

        insta::assert_snapshot!(disassemble_chunk(&heap, &chunk, "consts"), @r###"
        == consts ==
        0000    3 OP_CONSTANT      0 '7'
        0003    4 OP_PRINT
        "###);
    }

    #[test]
    fn jumps_show_their_target() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        chunk.write(Opcode::JumpIfFalse as u8, 1);
        chunk.write(0, 1);
        chunk.write(2, 1);
        chunk.write(Opcode::Nil as u8, 1);
        chunk.write(Opcode::Pop as u8, 1);

        let mut out = String::new();
        disassemble_instruction(&heap, &chunk, 0, &mut out);
        assert_eq!(out, "0000    1 OP_JUMP_IF_FALSE    0 -> 5\n");
    }
}
