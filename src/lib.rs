//! An assembler for the Gigatron TTL computer, covering:
//! - the vCPU instruction set executing from RAM
//! - the native microcoded instruction set resident in ROM
//! - DB/DW data directives, file inclusion and parameterized macros
//! - gprintf debug prints rendered by an attached emulator

pub mod assembler;
pub mod expression;
pub mod logging;

#[cfg(test)]
mod test;
