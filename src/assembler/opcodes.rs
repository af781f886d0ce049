//! Mnemonic lookup table for all three instruction families

/// Instruction family, deciding how operands are resolved and where the
/// bytes land (RAM for vCPU and DB/DW, ROM for native and DBR/DWR)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpcodeType {
    ReservedDb,
    ReservedDw,
    ReservedDbr,
    ReservedDwr,
    VCpu,
    Native,
}

/// Opcode metadata for one mnemonic
#[derive(Debug, Clone, Copy)]
pub struct InstructionType {
    pub opcode: u8,
    pub branch: u8,
    pub byte_size: usize,
    pub opcode_type: OpcodeType,
}

/// Look up a mnemonic, case-insensitively. `None` means the token is not an
/// instruction at all.
pub fn get_opcode(mnemonic: &str) -> Option<InstructionType> {
    use OpcodeType::*;

    let token = mnemonic.to_uppercase();
    let (opcode, branch, byte_size, opcode_type) = match token.as_str() {
        // vCPU instructions
        "ST" => (0x5E, 0x00, 2, VCpu),
        "STW" => (0x2B, 0x00, 2, VCpu),
        "STLW" => (0xEC, 0x00, 2, VCpu),
        "LD" => (0x1A, 0x00, 2, VCpu),
        "LDI" => (0x59, 0x00, 2, VCpu),
        "LDWI" => (0x11, 0x00, 3, VCpu),
        "LDW" => (0x21, 0x00, 2, VCpu),
        "LDLW" => (0xEE, 0x00, 2, VCpu),
        "ADDW" => (0x99, 0x00, 2, VCpu),
        "SUBW" => (0xB8, 0x00, 2, VCpu),
        "ADDI" => (0xE3, 0x00, 2, VCpu),
        "SUBI" => (0xE6, 0x00, 2, VCpu),
        "LSLW" => (0xE9, 0x00, 1, VCpu),
        "INC" => (0x93, 0x00, 2, VCpu),
        "ANDI" => (0x82, 0x00, 2, VCpu),
        "ANDW" => (0xF8, 0x00, 2, VCpu),
        "ORI" => (0x88, 0x00, 2, VCpu),
        "ORW" => (0xFA, 0x00, 2, VCpu),
        "XORI" => (0x8C, 0x00, 2, VCpu),
        "XORW" => (0xFC, 0x00, 2, VCpu),
        "PEEK" => (0xAD, 0x00, 1, VCpu),
        "DEEK" => (0xF6, 0x00, 1, VCpu),
        "POKE" => (0xF0, 0x00, 2, VCpu),
        "DOKE" => (0xF3, 0x00, 2, VCpu),
        "LUP" => (0x7F, 0x00, 2, VCpu),
        "BRA" => (0x90, 0x00, 2, VCpu),
        "CALL" => (0xCF, 0x00, 2, VCpu),
        "RET" => (0xFF, 0x00, 1, VCpu),
        "PUSH" => (0x75, 0x00, 1, VCpu),
        "POP" => (0x63, 0x00, 1, VCpu),
        "ALLOC" => (0xDF, 0x00, 2, VCpu),
        "SYS" => (0xB4, 0x00, 2, VCpu),
        "DEF" => (0xCD, 0x00, 2, VCpu),

        // vCPU conditional branches, one opcode selected by a branch byte
        "BEQ" => (0x35, 0x3F, 3, VCpu),
        "BNE" => (0x35, 0x72, 3, VCpu),
        "BLT" => (0x35, 0x50, 3, VCpu),
        "BGT" => (0x35, 0x4D, 3, VCpu),
        "BLE" => (0x35, 0x56, 3, VCpu),
        "BGE" => (0x35, 0x53, 3, VCpu),

        // data pseudo-ops
        "DB" => (0x00, 0x00, 2, ReservedDb),
        "DW" => (0x00, 0x00, 3, ReservedDw),
        "DBR" => (0x00, 0x00, 2, ReservedDbr),
        "DWR" => (0x00, 0x00, 3, ReservedDwr),

        // native instructions, high 6 bits of the opcode
        ".LD" => (0x00, 0x00, 2, Native),
        ".NOP" => (0x02, 0x00, 2, Native),
        ".ANDA" => (0x20, 0x00, 2, Native),
        ".ORA" => (0x40, 0x00, 2, Native),
        ".XORA" => (0x60, 0x00, 2, Native),
        ".ADDA" => (0x80, 0x00, 2, Native),
        ".SUBA" => (0xA0, 0x00, 2, Native),
        ".ST" => (0xC0, 0x00, 2, Native),
        ".JMP" => (0xE0, 0x00, 2, Native),
        ".BGT" => (0xE4, 0x00, 2, Native),
        ".BLT" => (0xE8, 0x00, 2, Native),
        ".BNE" => (0xEC, 0x00, 2, Native),
        ".BEQ" => (0xF0, 0x00, 2, Native),
        ".BGE" => (0xF4, 0x00, 2, Native),
        ".BLE" => (0xF8, 0x00, 2, Native),
        ".BRA" => (0xFC, 0x00, 2, Native),

        _ => return None,
    };

    Some(InstructionType {
        opcode,
        branch,
        byte_size,
        opcode_type,
    })
}

#[cfg(test)]
mod tests {
    use super::OpcodeType::*;
    use super::*;

    #[test]
    fn full_listing() {
        let table: &[(&str, u8, u8, usize, OpcodeType)] = &[
            ("ST", 0x5E, 0x00, 2, VCpu),
            ("STW", 0x2B, 0x00, 2, VCpu),
            ("STLW", 0xEC, 0x00, 2, VCpu),
            ("LD", 0x1A, 0x00, 2, VCpu),
            ("LDI", 0x59, 0x00, 2, VCpu),
            ("LDWI", 0x11, 0x00, 3, VCpu),
            ("LDW", 0x21, 0x00, 2, VCpu),
            ("LDLW", 0xEE, 0x00, 2, VCpu),
            ("ADDW", 0x99, 0x00, 2, VCpu),
            ("SUBW", 0xB8, 0x00, 2, VCpu),
            ("ADDI", 0xE3, 0x00, 2, VCpu),
            ("SUBI", 0xE6, 0x00, 2, VCpu),
            ("LSLW", 0xE9, 0x00, 1, VCpu),
            ("INC", 0x93, 0x00, 2, VCpu),
            ("ANDI", 0x82, 0x00, 2, VCpu),
            ("ANDW", 0xF8, 0x00, 2, VCpu),
            ("ORI", 0x88, 0x00, 2, VCpu),
            ("ORW", 0xFA, 0x00, 2, VCpu),
            ("XORI", 0x8C, 0x00, 2, VCpu),
            ("XORW", 0xFC, 0x00, 2, VCpu),
            ("PEEK", 0xAD, 0x00, 1, VCpu),
            ("DEEK", 0xF6, 0x00, 1, VCpu),
            ("POKE", 0xF0, 0x00, 2, VCpu),
            ("DOKE", 0xF3, 0x00, 2, VCpu),
            ("LUP", 0x7F, 0x00, 2, VCpu),
            ("BRA", 0x90, 0x00, 2, VCpu),
            ("CALL", 0xCF, 0x00, 2, VCpu),
            ("RET", 0xFF, 0x00, 1, VCpu),
            ("PUSH", 0x75, 0x00, 1, VCpu),
            ("POP", 0x63, 0x00, 1, VCpu),
            ("ALLOC", 0xDF, 0x00, 2, VCpu),
            ("SYS", 0xB4, 0x00, 2, VCpu),
            ("DEF", 0xCD, 0x00, 2, VCpu),
            ("BEQ", 0x35, 0x3F, 3, VCpu),
            ("BNE", 0x35, 0x72, 3, VCpu),
            ("BLT", 0x35, 0x50, 3, VCpu),
            ("BGT", 0x35, 0x4D, 3, VCpu),
            ("BLE", 0x35, 0x56, 3, VCpu),
            ("BGE", 0x35, 0x53, 3, VCpu),
            ("DB", 0x00, 0x00, 2, ReservedDb),
            ("DW", 0x00, 0x00, 3, ReservedDw),
            ("DBR", 0x00, 0x00, 2, ReservedDbr),
            ("DWR", 0x00, 0x00, 3, ReservedDwr),
            (".LD", 0x00, 0x00, 2, Native),
            (".NOP", 0x02, 0x00, 2, Native),
            (".ANDA", 0x20, 0x00, 2, Native),
            (".ORA", 0x40, 0x00, 2, Native),
            (".XORA", 0x60, 0x00, 2, Native),
            (".ADDA", 0x80, 0x00, 2, Native),
            (".SUBA", 0xA0, 0x00, 2, Native),
            (".ST", 0xC0, 0x00, 2, Native),
            (".JMP", 0xE0, 0x00, 2, Native),
            (".BGT", 0xE4, 0x00, 2, Native),
            (".BLT", 0xE8, 0x00, 2, Native),
            (".BNE", 0xEC, 0x00, 2, Native),
            (".BEQ", 0xF0, 0x00, 2, Native),
            (".BGE", 0xF4, 0x00, 2, Native),
            (".BLE", 0xF8, 0x00, 2, Native),
            (".BRA", 0xFC, 0x00, 2, Native),
        ];

        for &(mnemonic, opcode, branch, byte_size, opcode_type) in table {
            let entry = get_opcode(mnemonic).unwrap();
            assert_eq!(entry.opcode, opcode, "{}", mnemonic);
            assert_eq!(entry.branch, branch, "{}", mnemonic);
            assert_eq!(entry.byte_size, byte_size, "{}", mnemonic);
            assert_eq!(entry.opcode_type, opcode_type, "{}", mnemonic);
        }
    }

    #[test]
    fn case_insensitive() {
        assert_eq!(get_opcode("ldwi").unwrap().opcode, 0x11);
        assert_eq!(get_opcode(".bra").unwrap().opcode, 0xFC);
    }

    #[test]
    fn unknown_mnemonic() {
        assert!(get_opcode("FROBNICATE").is_none());
        assert!(get_opcode("").is_none());
    }
}
