//! Operand encoder for the native Gigatron instruction set
//!
//! A native opcode byte carries the operation in its high bits and two
//! low-order fields selecting the data source (bus mode) and destination
//! (address mode). The encoder lexes the operand text into structural
//! tokens and matches each recognized addressing form, OR-ing the field
//! bits into the base opcode.

use super::Assembler;
use crate::expression::{self, ExpressionType};

// Address-mode field, bits 2 to 4 of a native opcode
pub const D_AC: u8 = 0b000_00;
pub const X_AC: u8 = 0b001_00;
pub const YD_AC: u8 = 0b010_00;
pub const YX_AC: u8 = 0b011_00;
pub const D_X: u8 = 0b100_00;
pub const D_Y: u8 = 0b101_00;
pub const D_OUT: u8 = 0b110_00;
pub const YXPP_OUT: u8 = 0b111_00;

// Bus-mode field, bits 0 and 1
pub const BUS_D: u8 = 0b00;
pub const BUS_RAM: u8 = 0b01;
pub const BUS_AC: u8 = 0b10;
pub const BUS_IN: u8 = 0b11;

#[derive(Debug, PartialEq, Eq)]
enum Tok {
    Open,
    Close,
    Comma,
    Sym(String),
}

fn lex(input: &str) -> Vec<Tok> {
    let mut tokens = Vec::new();
    let mut symbol = String::new();
    for c in input.chars() {
        match c {
            '[' | ']' | ',' => {
                if !symbol.is_empty() {
                    tokens.push(Tok::Sym(std::mem::take(&mut symbol)));
                }
                tokens.push(match c {
                    '[' => Tok::Open,
                    ']' => Tok::Close,
                    _ => Tok::Comma,
                });
            }
            _ => symbol.push(c),
        }
    }
    if !symbol.is_empty() {
        tokens.push(Tok::Sym(symbol));
    }
    tokens
}

fn is_ac(s: &str) -> bool {
    s.eq_ignore_ascii_case("AC")
}

fn is_in(s: &str) -> bool {
    s.eq_ignore_ascii_case("IN")
}

fn is_x(s: &str) -> bool {
    s.eq_ignore_ascii_case("X")
}

fn is_xpp(s: &str) -> bool {
    s.eq_ignore_ascii_case("X++")
}

fn is_y(s: &str) -> bool {
    s.eq_ignore_ascii_case("Y")
}

fn is_out(s: &str) -> bool {
    s.eq_ignore_ascii_case("OUT")
}

// X, Y and OUT as the second half of a two-operand form
fn suffix_mode(s: &str) -> Option<u8> {
    if is_x(s) {
        Some(D_X)
    } else if is_y(s) {
        Some(D_Y)
    } else if is_out(s) {
        Some(D_OUT)
    } else {
        None
    }
}

// X and X++ inside a [Y,...] form
fn indexed_mode(s: &str) -> Option<u8> {
    if is_x(s) {
        Some(YX_AC)
    } else if is_xpp(s) {
        Some(YXPP_OUT)
    } else {
        None
    }
}

/// Resolve a native operand value: expression, then label (converted to a
/// ROM word index), then equate, then byte literal.
fn operand_value(asm: &Assembler, token: &str) -> Option<u8> {
    match expression::is_expression(token) {
        ExpressionType::Invalid => None,
        ExpressionType::Valid => asm.evaluate_expression(token, true).map(|v| v as u8),
        ExpressionType::NotExpression => {
            if let Some(label) = asm.label(token) {
                return Some(((label.address >> 1) & 0xFF) as u8);
            }
            if let Some(equate) = asm.equate(token) {
                return Some(equate.value as u8);
            }
            expression::string_to_u8(token)
        }
    }
}

/// Encode a native operand into the opcode's bus/address-mode bits and the
/// operand byte. `None` means the syntax was not recognized.
pub(super) fn encode_native(asm: &Assembler, base: u8, input: &str) -> Option<(u8, u8)> {
    use Tok::*;

    // NOP carries no operand
    if base == 0x02 {
        return Some((base, 0x00));
    }

    let tokens = lex(input);

    // the whole accumulator as the operand
    if let [Sym(s)] = &tokens[..] {
        if is_ac(s) {
            return Some((base | BUS_AC, 0x00));
        }
    }

    // jumps take y,[D] or y,D
    if base == 0xE0 {
        return match &tokens[..] {
            [Sym(y), Comma, Open, Sym(d), Close] if is_y(y) => {
                Some((base | BUS_RAM, operand_value(asm, d)?))
            }
            [Sym(y), Comma, Sym(d)] if is_y(y) => Some((base, operand_value(asm, d)?)),
            _ => None,
        };
    }

    // conditional branches take D or [D]
    if base >= 0xE4 {
        return match &tokens[..] {
            [Open, Sym(d), Close] => Some((base | BUS_RAM, operand_value(asm, d)?)),
            [Sym(d)] => Some((base, operand_value(asm, d)?)),
            _ => None,
        };
    }

    // ST writes the accumulator to memory, everything else reads memory
    let memory_bus = if base == 0xC0 { BUS_AC } else { BUS_RAM };

    match &tokens[..] {
        // IN and IN,[D]
        [Sym(s)] if is_in(s) => Some((base | BUS_IN, 0x00)),
        [Sym(s), Comma, Open, Sym(d), Close] if is_in(s) => {
            Some((base | BUS_IN, operand_value(asm, d)?))
        }

        // D
        [Sym(d)] => Some((base, operand_value(asm, d)?)),

        // [X] and [D]
        [Open, Sym(x), Close] if is_x(x) => Some((base | memory_bus | X_AC, 0x00)),
        [Open, Sym(d), Close] => Some((base | memory_bus, operand_value(asm, d)?)),

        // AC,X / AC,Y / AC,OUT, and AC with a redundant bracketed target
        [Sym(a), Comma, Sym(m)] if is_ac(a) && suffix_mode(m).is_some() => {
            Some((base | BUS_AC | suffix_mode(m)?, 0x00))
        }
        [Sym(a), Comma, Open, Sym(_), Close] if is_ac(a) => Some((base | BUS_AC, 0x00)),

        // D,X / D,Y / D,OUT
        [Sym(d), Comma, Sym(m)] if suffix_mode(m).is_some() => {
            Some((base | suffix_mode(m)?, operand_value(asm, d)?))
        }

        // [D],X / [D],Y / [D],OUT
        [Open, Sym(d), Close, Comma, Sym(m)] if suffix_mode(m).is_some() => {
            Some((base | memory_bus | suffix_mode(m)?, operand_value(asm, d)?))
        }

        // [Y,D] / [Y,X] / [Y,X++]
        [Open, Sym(y), Comma, Sym(x), Close] if is_y(y) => match indexed_mode(x) {
            Some(mode) => Some((base | memory_bus | mode, 0x00)),
            None => Some((base | memory_bus | YD_AC, operand_value(asm, x)?)),
        },

        // D,[D] / D,[X] / D,[Y]: the bracketed side is fixed by the opcode,
        // only the source D is encoded
        [Sym(d), Comma, Open, Sym(_), Close] => Some((base, operand_value(asm, d)?)),

        // D,[Y,X] / D,[Y,X++]
        [Sym(d), Comma, Open, Sym(y), Comma, Sym(x), Close] if is_y(y) => {
            Some((base | indexed_mode(x)?, operand_value(asm, d)?))
        }

        // [Y,X],OUT / [Y,X++],OUT
        [Open, Sym(y), Comma, Sym(x), Close, Comma, Sym(out)] if is_y(y) && is_out(out) => {
            Some((base | memory_bus | indexed_mode(x)?, 0x00))
        }

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::{Equate, Label};

    fn asm() -> Assembler {
        let mut asm = Assembler::new();
        asm.add_label(Label {
            name: "entry".to_string(),
            address: 0x0244,
        });
        asm.add_equate(Equate {
            name: "port".to_string(),
            value: 0x2C,
            is_custom_address: false,
        });
        asm
    }

    #[test]
    fn accumulator_and_input() {
        let asm = asm();
        assert_eq!(encode_native(&asm, 0x00, "AC"), Some((0x00 | BUS_AC, 0x00)));
        assert_eq!(encode_native(&asm, 0x00, "IN"), Some((0x00 | BUS_IN, 0x00)));
        assert_eq!(
            encode_native(&asm, 0x00, "IN,[0x2C]"),
            Some((0x00 | BUS_IN, 0x2C))
        );
    }

    #[test]
    fn immediate_and_ram() {
        let asm = asm();
        assert_eq!(encode_native(&asm, 0x00, "0x42"), Some((0x00, 0x42)));
        assert_eq!(
            encode_native(&asm, 0x00, "[port]"),
            Some((0x00 | BUS_RAM, 0x2C))
        );
        assert_eq!(
            encode_native(&asm, 0x00, "[X]"),
            Some((0x00 | BUS_RAM | X_AC, 0x00))
        );
    }

    #[test]
    fn two_operand_forms() {
        let asm = asm();
        assert_eq!(encode_native(&asm, 0x00, "5,X"), Some((0x00 | D_X, 5)));
        assert_eq!(encode_native(&asm, 0x00, "5,Y"), Some((0x00 | D_Y, 5)));
        assert_eq!(
            encode_native(&asm, 0x00, "AC,OUT"),
            Some((0x00 | BUS_AC | D_OUT, 0x00))
        );
        assert_eq!(
            encode_native(&asm, 0x00, "[5],OUT"),
            Some((0x00 | BUS_RAM | D_OUT, 5))
        );
        assert_eq!(encode_native(&asm, 0x00, "7,[Y]"), Some((0x00, 7)));
    }

    #[test]
    fn indexed_forms() {
        let asm = asm();
        assert_eq!(
            encode_native(&asm, 0x00, "[Y,7]"),
            Some((0x00 | BUS_RAM | YD_AC, 7))
        );
        assert_eq!(
            encode_native(&asm, 0x00, "[Y,X]"),
            Some((0x00 | BUS_RAM | YX_AC, 0x00))
        );
        assert_eq!(
            encode_native(&asm, 0x00, "9,[Y,X++]"),
            Some((0x00 | YXPP_OUT, 9))
        );
    }

    #[test]
    fn store_post_increment_out() {
        // .ST [Y,X++],OUT packs to 0xDE
        let asm = asm();
        assert_eq!(encode_native(&asm, 0xC0, "[Y,X++],OUT"), Some((0xDE, 0x00)));
    }

    #[test]
    fn jumps_and_branches() {
        let asm = asm();
        assert_eq!(
            encode_native(&asm, 0xE0, "y,[0x16]"),
            Some((0xE0 | BUS_RAM, 0x16))
        );
        assert_eq!(encode_native(&asm, 0xE0, "y,5"), Some((0xE0, 5)));
        // branch targets use ROM word indices, so label addresses halve
        assert_eq!(encode_native(&asm, 0xF0, "entry"), Some((0xF0, 0x22)));
        assert_eq!(
            encode_native(&asm, 0xF0, "[9]"),
            Some((0xF0 | BUS_RAM, 9))
        );
    }

    #[test]
    fn nop_takes_no_operand() {
        let asm = asm();
        assert_eq!(encode_native(&asm, 0x02, ""), Some((0x02, 0x00)));
    }

    #[test]
    fn malformed_operands() {
        let asm = asm();
        assert_eq!(encode_native(&asm, 0x00, "[Q,X]"), None);
        assert_eq!(encode_native(&asm, 0x00, "nosuch"), None);
        assert_eq!(encode_native(&asm, 0xE0, "[5]"), None);
    }
}
