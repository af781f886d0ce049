use std::{env, process};

use gtasm::assembler::{Assembler, DEFAULT_START_ADDRESS};
use gtasm::logging::error;

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: {} <input.vasm>", args[0]);
        process::exit(1);
    }

    let mut asm = Assembler::new();
    asm.assemble_from_file(&args[1], DEFAULT_START_ADDRESS)
        .unwrap_or_else(|e| {
            error(e.to_string());
            process::exit(2);
        });

    // listing: RAM bytes one per line, ROM bytes as opcode/operand word
    // pairs shown at their word index
    let mut address = asm.start_address();
    let mut custom_address = address;
    while let Some(byte) = asm.next_assembled_byte() {
        if byte.is_custom_address {
            address = byte.address;
            custom_address = byte.address;
        }
        if byte.is_rom_address {
            if address & 1 == 0 {
                print!(
                    "ROM : {:04X}  {:02X}",
                    custom_address.wrapping_add((address & 0x00FF) >> 1),
                    byte.data
                );
            } else {
                println!("{:02X}", byte.data);
            }
        } else {
            println!("RAM : {:04X}  {:02X}", address, byte.data);
        }
        address = address.wrapping_add(1);
    }
}
