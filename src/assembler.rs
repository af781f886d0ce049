//! Two-pass assembler for the Gigatron TTL computer
//!
//! Converts vCPU and native Gigatron assembly into a stream of addressed
//! bytes ready for loading into RAM and ROM images. The mnemonic pass
//! collects equates and labels and sizes every instruction so forward
//! references resolve; the code pass encodes operands and emits the
//! instruction list, which is then packed into 256-byte RAM segments.
//!
//! Supported syntax, one statement per line:
//!
//! ```ignore
//! _startAddress_  EQU     0x0200      ; reserved equates configure the run
//! _callTable_     EQU     0x007E
//! count           EQU     0x30        ; plain equate
//! entry           LDWI    0x0800      ; label at column 0, mnemonic after
//!                 CALL    draw        ; CALL folds through the call table
//! loop            BRA     loop
//! msg             DB      2 'hi'      ; byte data, strings expand per char
//!                 DW      entry       ; word data, little endian
//!                 .LD     [Y,X++]     ; native ROM instruction
//!                 gprintf("n=%d", *count)
//! %include "macros.i"
//! %MACRO  inc2 var
//!                 LDW     var
//!                 ADDI    2
//!                 STW     var
//! %ENDM
//! ```
//!
//! Mnemonics are case-insensitive; labels and equate names are not.
//! Comments start with `;` or `#` and run to the end of the line.

pub mod gprintf;
pub mod native;
pub mod opcodes;
pub mod preprocessor;
pub mod tokenizer;

use std::collections::HashMap;
use std::fmt;
use std::fs;

use crate::expression::{self, ExpressionType};
use crate::logging;
use gprintf::Gprintf;
use opcodes::{get_opcode, OpcodeType};
use preprocessor::LineToken;
use tokenizer::{tokenise_line, WHITESPACE};

/// Branch operands are relative to the second byte of the branch
const BRANCH_ADJUSTMENT: u8 = 2;

/// Default load address for vCPU programs
pub const DEFAULT_START_ADDRESS: u16 = 0x0200;

// vCPU program counter in zero page, low byte first
pub(crate) const VPC_LO: u16 = 0x0016;
pub(crate) const VPC_HI: u16 = 0x0017;

// Audio channel registers, one block per channel; RAM code overlapping
// these corrupts sound playback
const AUDIO_CHANNELS: [(u16, u16); 4] = [
    (0x01FA, 0x01FF),
    (0x02FA, 0x02FF),
    (0x03FA, 0x03FF),
    (0x04FA, 0x04FF),
];

const RESERVED_WORDS: [&str; 10] = [
    "_callTable_",
    "_startAddress_",
    "_singleStepWatch_",
    "_disableUpload_",
    "_cpuUsageAddressA_",
    "_cpuUsageAddressB_",
    "%include",
    "%MACRO",
    "%ENDM",
    "gprintf",
];

/// A named constant; becomes an address directive when its name reappears
/// as a label
#[derive(Debug, Clone)]
pub struct Equate {
    pub name: String,
    pub value: u16,
    pub is_custom_address: bool,
}

/// A code position collected in the mnemonic pass
#[derive(Debug, Clone)]
pub struct Label {
    pub name: String,
    pub address: u16,
}

/// One encoded instruction or data item
#[derive(Debug, Clone)]
pub struct Instruction {
    pub is_rom_address: bool,
    pub is_custom_address: bool,
    pub byte_size: usize,
    pub opcode: u8,
    pub operand0: u8,
    pub operand1: u8,
    pub address: u16,
    pub opcode_type: OpcodeType,
}

/// One byte of assembler output. The address is meaningful only on the
/// first byte of a segment, where `is_custom_address` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteCode {
    pub is_rom_address: bool,
    pub is_custom_address: bool,
    pub data: u8,
    pub address: u16,
}

/// One slot of the call table: a 16-bit target reachable through an 8-bit
/// operand
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallTableEntry {
    pub operand: u8,
    pub address: u16,
}

/// Hooks into the surrounding emulator and loader. Every method defaults
/// to a no-op so standalone assembly needs no host.
pub trait Host {
    fn disable_uploads(&mut self, _disable: bool) {}
    fn set_single_step_watch_address(&mut self, _address: u16) {}
    fn set_cpu_usage_address_a(&mut self, _address: u16) {}
    fn set_cpu_usage_address_b(&mut self, _address: u16) {}
    fn get_ram(&self, _address: u16) -> u8 {
        0
    }
    fn get_rom(&self, _address: u16, _lane: u8) -> u8 {
        0
    }
}

/// An error that aborts the assembly. Internal tables are left in an
/// undefined state; the next `assemble` call starts from scratch.
#[derive(Debug)]
pub enum Error {
    /// Main input or include file could not be read
    ReadError { path: String },
    /// Malformed %include statement
    BadInclude {
        line: String,
        file: String,
        line_number: usize,
    },
    /// Malformed macro definition or an invocation without its arguments
    BadMacro {
        reason: String,
        name: String,
        file: String,
        line_number: usize,
    },
    /// Equate, label or macro name already defined
    Duplicate {
        name: String,
        line: String,
        file: String,
        line_number: usize,
    },
    /// A reserved word used as a label
    Reserved {
        token: String,
        file: String,
        line_number: usize,
    },
    /// First token of a statement is not a known mnemonic
    BadOpcode {
        line: String,
        file: String,
        line_number: usize,
    },
    /// Instruction requires an operand that is not present
    MissingOperand {
        line: String,
        file: String,
        line_number: usize,
    },
    /// Operand is not a literal, equate, label or evaluable expression
    Unresolved {
        token: String,
        file: String,
        line_number: usize,
    },
    /// Native operand syntax not recognized
    BadNativeOperand {
        line: String,
        file: String,
        line_number: usize,
    },
    /// DB/DW data list could not be parsed
    BadData {
        line: String,
        file: String,
        line_number: usize,
    },
    /// Malformed gprintf directive
    BadGprintf {
        line: String,
        file: String,
        line_number: usize,
    },
    /// A vCPU or native instruction would straddle a 256-byte page
    PageBoundary {
        old_address: u16,
        new_address: u16,
        line: String,
        file: String,
        line_number: usize,
    },
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ReadError { path } => {
                write!(f, "failed to open file '{}'", path)
            }
            Error::BadInclude { line, file, line_number } => {
                write!(f, "bad %include statement : '{}' : in '{}' on line {}", line, file, line_number)
            }
            Error::BadMacro { reason, name, file, line_number } => {
                write!(f, "bad macro, {} : '{}' : in '{}' on line {}", reason, name, file, line_number)
            }
            Error::Duplicate { name, line, file, line_number } => {
                write!(f, "duplicate name '{}' : '{}' : in '{}' on line {}", name, line, file, line_number)
            }
            Error::Reserved { token, file, line_number } => {
                write!(f, "can't use reserved word as a label : '{}' : in '{}' on line {}", token, file, line_number)
            }
            Error::BadOpcode { line, file, line_number } => {
                write!(f, "bad opcode : '{}' : in '{}' on line {}", line, file, line_number)
            }
            Error::MissingOperand { line, file, line_number } => {
                write!(f, "missing operand/s : '{}' : in '{}' on line {}", line, file, line_number)
            }
            Error::Unresolved { token, file, line_number } => {
                write!(f, "missing label or equate : '{}' : in '{}' on line {}", token, file, line_number)
            }
            Error::BadNativeOperand { line, file, line_number } => {
                write!(f, "native instruction is malformed : '{}' : in '{}' on line {}", line, file, line_number)
            }
            Error::BadData { line, file, line_number } => {
                write!(f, "bad DB/DW data : '{}' : in '{}' on line {}", line, file, line_number)
            }
            Error::BadGprintf { line, file, line_number } => {
                write!(f, "bad gprintf format : '{}' : in '{}' on line {}", line, file, line_number)
            }
            Error::PageBoundary { old_address, new_address, line, file, line_number } => {
                write!(f, "page boundary compromised : {:04X} : {:04X} : '{}' : in '{}' on line {}", old_address, new_address, line, file, line_number)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Mnemonic,
    Code,
}

pub(crate) fn strip_label_colon(token: &str) -> &str {
    token.strip_suffix(':').unwrap_or(token)
}

// The chars between the first pair of quotes, if any. `require_content`
// rejects empty strings, the stricter rule applied to a leading operand.
fn quoted_chars(token: &str, require_content: bool) -> Option<Vec<u8>> {
    let q1 = token.find(|c: char| c == '\'' || c == '"')?;
    let q2 = token[q1 + 1..]
        .find(|c: char| c == '\'' || c == '"')
        .map(|p| p + q1 + 1)?;
    if require_content && q2 - q1 <= 1 {
        return None;
    }
    Some(token[q1 + 1..q2].bytes().collect())
}

// Concatenate tokens into one expression string, stopping at a comment
fn pre_process_expression(tokens: &[String], token_index: usize, strip_whitespace: bool) -> String {
    let mut input = String::new();
    for token in &tokens[token_index..] {
        if token.contains(';') || token.contains('#') {
            break;
        }
        input.push_str(token);
    }
    if strip_whitespace {
        input.retain(|c| !c.is_whitespace());
    }
    input
}

// Find `symbol` in `input` bounded by expression separators or the string
// edges, starting at `from`
fn find_symbol(input: &str, symbol: &str, from: usize) -> Option<usize> {
    const SEPARATORS: &str = "+-*/().,!?;#'\"[] \t\n\r";
    let len = input.len();
    let mut pos = from;
    if pos >= len {
        return None;
    }
    loop {
        let sep = input[pos..]
            .find(|c: char| SEPARATORS.contains(c))
            .map(|p| p + pos);
        let end = sep.unwrap_or(len);
        if &input[pos..end] == symbol {
            return Some(pos);
        }
        match sep {
            Some(sep) => pos = sep + 1,
            None => return None,
        }
    }
}

/// The assembler context: every symbol table, the address cursors and the
/// emitted output. One instance assembles one file at a time.
pub struct Assembler {
    file_name: String,
    include_path: String,
    call_table: u16,
    start_address: u16,
    current_address: u16,
    equates: Vec<Equate>,
    equate_index: HashMap<String, usize>,
    labels: Vec<Label>,
    label_index: HashMap<String, usize>,
    instructions: Vec<Instruction>,
    byte_code: Vec<ByteCode>,
    call_table_entries: Vec<CallTableEntry>,
    pub(crate) gprintfs: Vec<Gprintf>,
    byte_count: usize,
    // segment base tracked by the page boundary check
    page_address: u16,
    // an address directive on a label-only line binds to the next
    // emitted instruction
    pending_custom_address: Option<u16>,
    host: Option<Box<dyn Host>>,
}

impl Assembler {
    pub fn new() -> Assembler {
        Assembler {
            file_name: String::new(),
            include_path: String::new(),
            call_table: 0x0000,
            start_address: DEFAULT_START_ADDRESS,
            current_address: DEFAULT_START_ADDRESS,
            equates: Vec::new(),
            equate_index: HashMap::new(),
            labels: Vec::new(),
            label_index: HashMap::new(),
            instructions: Vec::new(),
            byte_code: Vec::new(),
            call_table_entries: Vec::new(),
            gprintfs: Vec::new(),
            byte_count: 0,
            page_address: 0x0000,
            pending_custom_address: None,
            host: None,
        }
    }

    /// Prefix joined onto every `%include` argument
    pub fn set_include_path(&mut self, include_path: &str) {
        self.include_path = include_path.to_string();
    }

    /// Attach the emulator/loader collaborator
    pub fn set_host(&mut self, host: Box<dyn Host>) {
        self.host = Some(host);
    }

    /// The effective start address of the last assembly
    pub fn start_address(&self) -> u16 {
        self.start_address
    }

    /// The emitted byte stream
    pub fn byte_code(&self) -> &[ByteCode] {
        &self.byte_code
    }

    /// Allocated call table slots, in allocation order
    pub fn call_table_entries(&self) -> &[CallTableEntry] {
        &self.call_table_entries
    }

    /// Registered debug prints
    pub fn gprintfs(&self) -> &[Gprintf] {
        &self.gprintfs
    }

    /// Labels collected by the mnemonic pass
    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    /// Empty every table and reset the output cursors
    pub fn clear(&mut self) {
        self.byte_code.clear();
        self.labels.clear();
        self.label_index.clear();
        self.equates.clear();
        self.equate_index.clear();
        self.instructions.clear();
        self.call_table_entries.clear();
        self.gprintfs.clear();
        self.byte_count = 0;
        self.page_address = 0x0000;
        self.pending_custom_address = None;
    }

    /// Assemble a source file
    pub fn assemble_from_file(&mut self, path: &str, start_address: u16) -> Result<(), Error> {
        let source = fs::read_to_string(path).map_err(|_| Error::ReadError {
            path: path.to_string(),
        })?;
        self.assemble(path, &source, start_address)
    }

    /// Assemble source text. `file_name` is used for diagnostics only.
    pub fn assemble(
        &mut self,
        file_name: &str,
        source: &str,
        start_address: u16,
    ) -> Result<(), Error> {
        self.file_name = file_name.to_string();
        self.call_table = 0x0000;
        self.start_address = start_address;
        self.current_address = start_address;
        self.clear();
        if let Some(host) = self.host.as_mut() {
            host.disable_uploads(false);
        }

        let mut lines: Vec<LineToken> = source
            .lines()
            .enumerate()
            .map(|(index, text)| LineToken {
                text: text.to_string(),
                line_number: index + 1,
                ..Default::default()
            })
            .collect();
        preprocessor::preprocess(&self.include_path, file_name, &mut lines, true)?;

        // the mnemonic pass evaluates equates, labels and sizes, the code
        // pass encodes operands and emits instructions
        for pass in [Pass::Mnemonic, Pass::Code] {
            self.page_address = 0x0000;
            for line in &lines {
                self.assemble_line(pass, line)?;
            }
        }

        self.pack_byte_code_buffer();
        gprintf::parse_gprintfs(self)?;

        Ok(())
    }

    /// Pull the next assembled byte. `None` marks the end of the stream and
    /// rewinds the cursor for another read.
    pub fn next_assembled_byte(&mut self) -> Option<ByteCode> {
        if self.byte_count >= self.byte_code.len() {
            self.byte_count = 0;
            return None;
        }
        let byte = self.byte_code[self.byte_count].clone();
        self.byte_count += 1;
        Some(byte)
    }

    pub(crate) fn origin(&self, line: &LineToken) -> (String, usize) {
        if line.from_include {
            (line.include_name.clone(), line.include_line)
        } else {
            (self.file_name.clone(), line.line_number)
        }
    }

    fn equate(&self, name: &str) -> Option<&Equate> {
        self.equate_index.get(name).map(|&index| &self.equates[index])
    }

    fn label(&self, name: &str) -> Option<&Label> {
        self.label_index.get(name).map(|&index| &self.labels[index])
    }

    fn add_equate(&mut self, equate: Equate) {
        self.equate_index.insert(equate.name.clone(), self.equates.len());
        self.equates.push(equate);
    }

    fn add_label(&mut self, label: Label) {
        self.label_index.insert(label.name.clone(), self.labels.len());
        self.labels.push(label);
    }

    // Substitute every equate name with its decimal value, in declaration
    // order, bounded by expression separators
    fn apply_equates(&self, expression: &mut String) {
        for equate in &self.equates {
            let value = equate.value.to_string();
            let mut from = 0;
            while let Some(pos) = find_symbol(expression, &equate.name, from) {
                expression.replace_range(pos..pos + equate.name.len(), &value);
                from = pos + value.len();
            }
        }
    }

    // Substitute every label name with its address, halved for native code
    // where ROM is addressed in words
    fn apply_labels(&self, expression: &mut String, native_code: bool) {
        for label in &self.labels {
            let address = if native_code {
                label.address >> 1
            } else {
                label.address
            };
            let value = address.to_string();
            let mut from = 0;
            while let Some(pos) = find_symbol(expression, &label.name, from) {
                expression.replace_range(pos..pos + label.name.len(), &value);
                from = pos + value.len();
            }
        }
    }

    pub(crate) fn evaluate_expression(&self, input: &str, native_code: bool) -> Option<u16> {
        let mut text = input.to_string();
        self.apply_equates(&mut text);
        self.apply_labels(&mut text, native_code);
        text.retain(|c| !c.is_whitespace());
        expression::parse(&text)
    }

    pub(crate) fn evaluate_equate_operand(&self, token: &str) -> Option<u16> {
        match expression::is_expression(token) {
            ExpressionType::Invalid => None,
            ExpressionType::Valid => self.evaluate_expression(token, false),
            ExpressionType::NotExpression => self.equate(token).map(|equate| equate.value),
        }
    }

    pub(crate) fn evaluate_label_operand(&self, token: &str) -> Option<u16> {
        match expression::is_expression(token) {
            ExpressionType::Invalid => None,
            ExpressionType::Valid => self.evaluate_expression(token, false),
            ExpressionType::NotExpression => self.label(token).map(|label| label.address),
        }
    }

    // Operand starting at `token_index`: one raw token for compound data
    // lists, the concatenated remainder of the line otherwise
    fn equate_operand(&self, tokens: &[String], token_index: usize, compound: bool) -> Option<u16> {
        if token_index >= tokens.len() {
            return None;
        }
        let input = if compound {
            tokens[token_index].clone()
        } else {
            pre_process_expression(tokens, token_index, false)
        };
        self.evaluate_equate_operand(&input)
    }

    fn label_operand(&self, tokens: &[String], token_index: usize, compound: bool) -> Option<u16> {
        if token_index >= tokens.len() {
            return None;
        }
        let input = if compound {
            tokens[token_index].clone()
        } else {
            pre_process_expression(tokens, token_index, false)
        };
        self.evaluate_label_operand(&input)
    }

    fn evaluate_equates(
        &mut self,
        tokens: &[String],
        pass: Pass,
        line: &LineToken,
    ) -> Result<bool, Error> {
        if !tokens[1].eq_ignore_ascii_case("EQU") {
            return Ok(false);
        }
        if pass == Pass::Mnemonic {
            let value = if tokens.len() > 2 {
                expression::string_to_u16(&tokens[2])
            } else {
                None
            }
            .or_else(|| self.equate_operand(tokens, 2, false));
            let value = match value {
                Some(value) => value,
                None => {
                    let (file, line_number) = self.origin(line);
                    return Err(Error::Unresolved {
                        token: line.text.clone(),
                        file,
                        line_number,
                    });
                }
            };

            match tokens[0].as_str() {
                "_callTable_" => self.call_table = value,
                "_startAddress_" => {
                    self.start_address = value;
                    self.current_address = value;
                }
                "_disableUpload_" => {
                    if let Some(host) = self.host.as_mut() {
                        host.disable_uploads(value != 0);
                    }
                }
                "_singleStepWatch_" => {
                    if let Some(host) = self.host.as_mut() {
                        host.set_single_step_watch_address(value);
                    }
                }
                "_cpuUsageAddressA_" => {
                    if let Some(host) = self.host.as_mut() {
                        host.set_cpu_usage_address_a(value);
                    }
                }
                "_cpuUsageAddressB_" => {
                    if let Some(host) = self.host.as_mut() {
                        host.set_cpu_usage_address_b(value);
                    }
                }
                _ => {
                    if self.equate(&tokens[0]).is_some() {
                        let (file, line_number) = self.origin(line);
                        return Err(Error::Duplicate {
                            name: tokens[0].clone(),
                            line: line.text.clone(),
                            file,
                            line_number,
                        });
                    }
                    self.add_equate(Equate {
                        name: tokens[0].clone(),
                        value,
                        is_custom_address: false,
                    });
                }
            }
        }
        Ok(true)
    }

    fn evaluate_labels(
        &mut self,
        tokens: &[String],
        pass: Pass,
        line: &LineToken,
    ) -> Result<(), Error> {
        if pass != Pass::Mnemonic {
            return Ok(());
        }
        let name = strip_label_colon(&tokens[0]);
        if RESERVED_WORDS.contains(&name) {
            let (file, line_number) = self.origin(line);
            return Err(Error::Reserved {
                token: tokens[0].clone(),
                file,
                line_number,
            });
        }
        if self.label(name).is_some() {
            let (file, line_number) = self.origin(line);
            return Err(Error::Duplicate {
                name: name.to_string(),
                line: line.text.clone(),
                file,
                line_number,
            });
        }
        // an equate name reused as a label is an address directive
        if let Some(index) = self.equate_index.get(name).copied() {
            self.equates[index].is_custom_address = true;
            self.current_address = self.equates[index].value;
        }
        self.add_label(Label {
            name: name.to_string(),
            address: self.current_address,
        });
        Ok(())
    }

    fn assemble_line(&mut self, pass: Pass, line: &LineToken) -> Result<(), Error> {
        let text = &line.text;
        let non_white = match text.find(|c: char| !WHITESPACE.contains(c)) {
            Some(pos) => pos,
            None => return Ok(()),
        };
        let tokens = tokenise_line(text);
        if tokens.is_empty() {
            return Ok(());
        }
        if tokens[0].contains(';') || tokens[0].contains('#') {
            return Ok(());
        }

        // gprintf lines register on the mnemonic pass and are never encoded
        if gprintf::create_gprintf(self, pass == Pass::Mnemonic, line)? {
            return Ok(());
        }

        // equates and labels live at column 0
        let mut token_index = 0;
        if non_white == 0 {
            if tokens.len() >= 2 {
                if self.evaluate_equates(&tokens, pass, line)? {
                    return Ok(());
                }
                self.evaluate_labels(&tokens, pass, line)?;
            } else if get_opcode(&tokens[0]).is_none() {
                // a label alone on its line
                self.evaluate_labels(&tokens, pass, line)?;
                if pass == Pass::Code {
                    self.note_custom_address(&tokens);
                }
                return Ok(());
            }
            if tokens.len() > 1 {
                token_index += 1;
            }
        }

        // a trailing comment after a label leaves nothing to assemble
        if tokens[token_index].contains(';') || tokens[token_index].contains('#') {
            if pass == Pass::Code && non_white == 0 {
                self.note_custom_address(&tokens);
            }
            return Ok(());
        }

        let instruction_type = match get_opcode(&tokens[token_index]) {
            Some(instruction_type) => instruction_type,
            None => {
                let (file, line_number) = self.origin(line);
                return Err(Error::BadOpcode {
                    line: text.clone(),
                    file,
                    line_number,
                });
            }
        };
        token_index += 1;

        let opcode = instruction_type.opcode;
        let branch = instruction_type.branch;
        let opcode_type = instruction_type.opcode_type;
        let mut output_size = instruction_type.byte_size;
        let compound = matches!(
            opcode_type,
            OpcodeType::ReservedDb
                | OpcodeType::ReservedDbr
                | OpcodeType::ReservedDw
                | OpcodeType::ReservedDwr
        );
        let mut instruction = Instruction {
            is_rom_address: false,
            is_custom_address: false,
            byte_size: output_size,
            opcode,
            operand0: 0x00,
            operand1: 0x00,
            address: self.current_address,
            opcode_type,
        };

        // data sizes depend on the operand walk, done in the mnemonic pass
        // so address assignment stays correct
        if pass == Pass::Mnemonic {
            if matches!(opcode_type, OpcodeType::ReservedDb | OpcodeType::ReservedDbr) {
                output_size = 1;
                if token_index + 1 < tokens.len() {
                    output_size = self
                        .handle_define_byte(&tokens, token_index, &instruction, false, output_size)
                        .ok_or_else(|| {
                            let (file, line_number) = self.origin(line);
                            Error::BadData {
                                line: text.clone(),
                                file,
                                line_number,
                            }
                        })?;
                }
            } else if matches!(opcode_type, OpcodeType::ReservedDw | OpcodeType::ReservedDwr) {
                output_size = 2;
                if token_index + 1 < tokens.len() {
                    output_size = self
                        .handle_define_word(&tokens, token_index, &instruction, false, output_size)
                        .ok_or_else(|| {
                            let (file, line_number) = self.origin(line);
                            Error::BadData {
                                line: text.clone(),
                                file,
                                line_number,
                            }
                        })?;
                }
            }
        }

        if pass == Pass::Code {
            let mut operand_valid = false;

            // native NOP takes no operand at all
            if opcode_type == OpcodeType::Native && opcode == 0x02 {
                operand_valid = true;
            } else if (output_size == 2 || output_size == 3) && tokens.len() <= token_index {
                let (file, line_number) = self.origin(line);
                return Err(Error::MissingOperand {
                    line: text.clone(),
                    file,
                    line_number,
                });
            }

            // the first instruction inherits the start address
            if self.instructions.is_empty() {
                instruction.address = self.start_address;
                instruction.is_custom_address = true;
                self.current_address = self.start_address;
            }

            // a leading token bound to a flagged equate restarts emission
            // at that address
            let custom = self
                .equate(strip_label_colon(&tokens[0]))
                .filter(|equate| equate.is_custom_address)
                .map(|equate| equate.value);
            if let Some(address) = custom {
                instruction.address = address;
                instruction.is_custom_address = true;
                self.current_address = address;
            }
            if let Some(address) = self.pending_custom_address.take() {
                instruction.address = address;
                instruction.is_custom_address = true;
                self.current_address = address;
            }

            match output_size {
                1 => {
                    self.instructions.push(instruction.clone());
                    self.check_invalid_address(self.current_address, output_size, &instruction, line)?;
                }
                2 => {
                    self.assemble_two_bytes(
                        &tokens,
                        token_index,
                        line,
                        &mut instruction,
                        opcode,
                        opcode_type,
                        compound,
                        operand_valid,
                        &mut output_size,
                    )?;
                }
                _ => {
                    self.assemble_three_bytes(
                        &tokens,
                        token_index,
                        line,
                        &mut instruction,
                        branch,
                        opcode_type,
                        compound,
                        &mut output_size,
                    )?;
                }
            }
        }

        self.current_address = self.current_address.wrapping_add(output_size as u16);
        Ok(())
    }

    // A label-only line naming a flagged equate still restarts emission
    // at that address for whatever instruction comes next
    fn note_custom_address(&mut self, tokens: &[String]) {
        let value = self
            .equate(strip_label_colon(&tokens[0]))
            .filter(|equate| equate.is_custom_address)
            .map(|equate| equate.value);
        if let Some(value) = value {
            self.current_address = value;
            self.pending_custom_address = Some(value);
        }
    }

    fn unresolved(&self, token: &str, line: &LineToken) -> Error {
        let (file, line_number) = self.origin(line);
        Error::Unresolved {
            token: token.to_string(),
            file,
            line_number,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble_two_bytes(
        &mut self,
        tokens: &[String],
        token_index: usize,
        line: &LineToken,
        instruction: &mut Instruction,
        opcode: u8,
        opcode_type: OpcodeType,
        compound: bool,
        mut operand_valid: bool,
        output_size: &mut usize,
    ) -> Result<(), Error> {
        let mut opcode = opcode;
        let mut operand: u8 = 0x00;

        // BRA only accepts labels
        if opcode_type == OpcodeType::VCpu && opcode == 0x90 {
            let target = self
                .label_operand(tokens, token_index, false)
                .ok_or_else(|| self.unresolved(&tokens[token_index], line))?;
            operand = (target as u8).wrapping_sub(BRANCH_ADJUSTMENT);
            operand_valid = true;
        }
        // CALL folds its target into the shared call table
        else if opcode_type == OpcodeType::VCpu && opcode == 0xCF {
            if self.call_table != 0 {
                let target = self
                    .label_operand(tokens, token_index, false)
                    .ok_or_else(|| self.unresolved(&tokens[token_index], line))?;
                operand = self.call_table_operand(target);
                operand_valid = true;
            } else {
                let (file, line_number) = self.origin(line);
                logging::warning(
                    "no call table configured, CALL operand resolves directly".to_string(),
                    &file,
                    line_number,
                );
            }
        }

        if opcode_type != OpcodeType::Native && !operand_valid {
            operand = if let Some(value) = expression::string_to_u8(&tokens[token_index]) {
                value
            } else if let Some(chars) = quoted_chars(&tokens[token_index], true) {
                chars[0]
            } else if let Some(value) = self.equate_operand(tokens, token_index, compound) {
                value as u8
            } else if let Some(value) = self.label_operand(tokens, token_index, compound) {
                value as u8
            } else {
                return Err(self.unresolved(&tokens[token_index], line));
            };
        }

        if opcode_type == OpcodeType::Native {
            if !operand_valid {
                let input = pre_process_expression(tokens, token_index, true);
                match native::encode_native(self, opcode, &input) {
                    Some((packed, value)) => {
                        opcode = packed;
                        operand = value;
                    }
                    None => {
                        let (file, line_number) = self.origin(line);
                        return Err(Error::BadNativeOperand {
                            line: line.text.clone(),
                            file,
                            line_number,
                        });
                    }
                }
            }
            instruction.is_rom_address = true;
            instruction.opcode = opcode;
            instruction.operand0 = operand;
            self.instructions.push(instruction.clone());
            self.check_invalid_address(self.current_address, *output_size, instruction, line)?;
            self.verify_rom(instruction, line);
        } else if matches!(opcode_type, OpcodeType::ReservedDb | OpcodeType::ReservedDbr) {
            // first data byte, the walk appends the rest
            *output_size = 1;
            instruction.is_rom_address = opcode_type == OpcodeType::ReservedDbr;
            instruction.byte_size = 1;
            instruction.opcode = operand;
            self.instructions.push(instruction.clone());
            if token_index + 1 < tokens.len() {
                *output_size = self
                    .handle_define_byte(tokens, token_index, instruction, true, *output_size)
                    .ok_or_else(|| {
                        let (file, line_number) = self.origin(line);
                        Error::BadData {
                            line: line.text.clone(),
                            file,
                            line_number,
                        }
                    })?;
            }
            self.check_invalid_address(self.current_address, *output_size, instruction, line)?;
        } else {
            instruction.operand0 = operand;
            self.instructions.push(instruction.clone());
            self.check_invalid_address(self.current_address, *output_size, instruction, line)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble_three_bytes(
        &mut self,
        tokens: &[String],
        token_index: usize,
        line: &LineToken,
        instruction: &mut Instruction,
        branch: u8,
        opcode_type: OpcodeType,
        compound: bool,
        output_size: &mut usize,
    ) -> Result<(), Error> {
        // conditional branches share one opcode and carry the condition in
        // the first operand byte
        if branch != 0 {
            let target = self
                .label_operand(tokens, token_index, false)
                .ok_or_else(|| self.unresolved(&tokens[token_index], line))?;
            instruction.operand0 = branch;
            instruction.operand1 = (target as u8).wrapping_sub(BRANCH_ADJUSTMENT);
            self.instructions.push(instruction.clone());
            self.check_invalid_address(self.current_address, *output_size, instruction, line)?;
            return Ok(());
        }

        let operand = if let Some(value) = expression::string_to_u16(&tokens[token_index]) {
            value
        } else if let Some(value) = self.equate_operand(tokens, token_index, compound) {
            value
        } else if let Some(value) = self.label_operand(tokens, token_index, compound) {
            value
        } else {
            return Err(self.unresolved(&tokens[token_index], line));
        };

        if matches!(opcode_type, OpcodeType::ReservedDw | OpcodeType::ReservedDwr) {
            // first data word, little endian
            *output_size = 2;
            instruction.is_rom_address = opcode_type == OpcodeType::ReservedDwr;
            instruction.byte_size = 2;
            instruction.opcode = (operand & 0xFF) as u8;
            instruction.operand0 = (operand >> 8) as u8;
            self.instructions.push(instruction.clone());
            if token_index + 1 < tokens.len() {
                *output_size = self
                    .handle_define_word(tokens, token_index, instruction, true, *output_size)
                    .ok_or_else(|| {
                        let (file, line_number) = self.origin(line);
                        Error::BadData {
                            line: line.text.clone(),
                            file,
                            line_number,
                        }
                    })?;
            }
            self.check_invalid_address(self.current_address, *output_size, instruction, line)?;
        } else {
            instruction.operand0 = (operand & 0xFF) as u8;
            instruction.operand1 = (operand >> 8) as u8;
            self.instructions.push(instruction.clone());
            self.check_invalid_address(self.current_address, *output_size, instruction, line)?;
        }
        Ok(())
    }

    fn push_data_byte(&mut self, template: &Instruction, data: u8) {
        self.instructions.push(Instruction {
            is_rom_address: template.is_rom_address,
            is_custom_address: false,
            byte_size: 1,
            opcode: data,
            operand0: 0x00,
            operand1: 0x00,
            address: 0x0000,
            opcode_type: template.opcode_type,
        });
    }

    // Walk a DB operand list. The first operand was consumed by the caller;
    // if it was a string its remaining chars are expanded here. Returns the
    // accumulated size, or None when nothing could be parsed.
    fn handle_define_byte(
        &mut self,
        tokens: &[String],
        token_index: usize,
        template: &Instruction,
        create: bool,
        mut size: usize,
    ) -> Option<usize> {
        let mut success = false;

        if let Some(chars) = quoted_chars(&tokens[token_index], true) {
            if create {
                for &c in &chars[1..] {
                    self.push_data_byte(template, c);
                }
            }
            size += chars.len() - 1;
            success = true;
        }

        for token in &tokens[token_index + 1..] {
            if token.contains(';') || token.contains('#') {
                success = true;
                break;
            }
            if let Some(chars) = quoted_chars(token, false) {
                if create {
                    for &c in &chars {
                        self.push_data_byte(template, c);
                    }
                }
                size += chars.len();
                success = true;
                continue;
            }
            let operand = if let Some(value) = expression::string_to_u8(token) {
                value
            } else if let Some(value) = self.evaluate_equate_operand(token) {
                value as u8
            } else if let Some(value) = self.evaluate_label_operand(token) {
                value as u8
            } else {
                break;
            };
            if create {
                self.push_data_byte(template, operand);
            }
            size += 1;
            success = true;
        }

        if success {
            Some(size)
        } else {
            None
        }
    }

    // Walk a DW operand list, two bytes per item, little endian
    fn handle_define_word(
        &mut self,
        tokens: &[String],
        token_index: usize,
        template: &Instruction,
        create: bool,
        mut size: usize,
    ) -> Option<usize> {
        let mut success = false;

        for token in &tokens[token_index + 1..] {
            if token.contains(';') || token.contains('#') {
                success = true;
                break;
            }
            let operand = if let Some(value) = expression::string_to_u16(token) {
                value
            } else if let Some(value) = self.evaluate_equate_operand(token) {
                value
            } else if let Some(value) = self.evaluate_label_operand(token) {
                value
            } else {
                break;
            };
            if create {
                self.instructions.push(Instruction {
                    is_rom_address: template.is_rom_address,
                    is_custom_address: false,
                    byte_size: 2,
                    opcode: (operand & 0xFF) as u8,
                    operand0: (operand >> 8) as u8,
                    operand1: 0x00,
                    address: 0x0000,
                    opcode_type: template.opcode_type,
                });
            }
            size += 2;
            success = true;
        }

        if success {
            Some(size)
        } else {
            None
        }
    }

    // Reuse an existing slot for the target or grow the table down by one
    // 2-byte entry, returning the 8-bit indirection operand
    fn call_table_operand(&mut self, address: u16) -> u8 {
        if let Some(entry) = self
            .call_table_entries
            .iter()
            .find(|entry| entry.address == address)
        {
            return entry.operand;
        }
        let operand = (self.call_table & 0x00FF) as u8;
        self.call_table_entries.push(CallTableEntry { operand, address });
        self.call_table = self.call_table.wrapping_sub(2);
        operand
    }

    fn check_invalid_address(
        &mut self,
        current_address: u16,
        size: usize,
        instruction: &Instruction,
        line: &LineToken,
    ) -> Result<(), Error> {
        let last = current_address.wrapping_add(size as u16).wrapping_sub(1);

        // audio channel stomping is survivable, warn only
        if !instruction.is_rom_address {
            let hit = AUDIO_CHANNELS.iter().any(|&(lo, hi)| {
                (current_address >= lo && current_address <= hi) || (last >= lo && last <= hi)
            });
            if hit {
                let (file, line_number) = self.origin(line);
                logging::warning(
                    format!(
                        "audio channel boundary compromised : {:04X} <-> {:04X} : '{}'",
                        current_address, last, line.text
                    ),
                    &file,
                    line_number,
                );
            }
        }

        if matches!(instruction.opcode_type, OpcodeType::VCpu | OpcodeType::Native) {
            if instruction.is_custom_address {
                self.page_address = instruction.address;
            }
            let old_address = if instruction.is_rom_address {
                self.page_address.wrapping_add((current_address & 0xFF) >> 1)
            } else {
                current_address
            };
            let new_address = if instruction.is_rom_address {
                self.page_address.wrapping_add((last & 0xFF) >> 1)
            } else {
                last
            };
            if (old_address >> 8) != (new_address >> 8) {
                let (file, line_number) = self.origin(line);
                return Err(Error::PageBoundary {
                    old_address,
                    new_address,
                    line: line.text.clone(),
                    file,
                    line_number,
                });
            }
        }
        Ok(())
    }

    // Native code normally shadows an existing ROM image; disagreement is
    // reported but tolerated
    fn verify_rom(&self, instruction: &Instruction, line: &LineToken) {
        let host = match self.host.as_ref() {
            Some(host) => host,
            None => return,
        };
        let address = instruction.address >> 1;
        let opcode = host.get_rom(address, 0);
        let operand = host.get_rom(address, 1);
        if instruction.opcode != opcode || instruction.operand0 != operand {
            let (file, line_number) = self.origin(line);
            logging::warning(
                format!(
                    "native instruction mismatch at {:04X} : asm=0x{:02X}{:02X} : rom=0x{:02X}{:02X}",
                    address, instruction.opcode, instruction.operand0, opcode, operand
                ),
                &file,
                line_number,
            );
        }
    }

    fn pack_byte_code(&mut self, instruction: &Instruction) {
        self.byte_code.push(ByteCode {
            is_rom_address: instruction.is_rom_address,
            is_custom_address: instruction.is_custom_address,
            data: instruction.opcode,
            address: instruction.address,
        });
        if instruction.byte_size >= 2 {
            self.byte_code.push(ByteCode {
                is_rom_address: instruction.is_rom_address,
                is_custom_address: false,
                data: instruction.operand0,
                address: 0x0000,
            });
        }
        if instruction.byte_size >= 3 {
            self.byte_code.push(ByteCode {
                is_rom_address: instruction.is_rom_address,
                is_custom_address: false,
                data: instruction.operand1,
                address: 0x0000,
            });
        }
    }

    // Segment RAM output into 256-byte pages and append the call table
    fn pack_byte_code_buffer(&mut self) {
        let mut segment_offset: u16 = 0x0000;
        let mut segment_address: u16 = 0x0000;

        for index in 0..self.instructions.len() {
            if !self.instructions[index].is_rom_address {
                if self.instructions[index].is_custom_address {
                    segment_offset = 0x0000;
                    segment_address = self.instructions[index].address;
                }
                // force a new segment at each page multiple; an instruction
                // straddling a page was already rejected by the code pass
                if !self.instructions[index].is_custom_address && segment_offset % 256 == 0 {
                    self.instructions[index].is_custom_address = true;
                    self.instructions[index].address =
                        segment_address.wrapping_add(segment_offset);
                }
                segment_offset =
                    segment_offset.wrapping_add(self.instructions[index].byte_size as u16);
            }
            let instruction = self.instructions[index].clone();
            self.pack_byte_code(&instruction);
        }

        // the call table grew downwards; emit slots in reverse allocation
        // order so addresses ascend
        if self.call_table != 0 && !self.call_table_entries.is_empty() {
            let end = self.call_table_entries.len() - 1;
            for index in (0..=end).rev() {
                let entry = self.call_table_entries[index].clone();
                let address = self.call_table.wrapping_add(((end - index) as u16) * 2 + 2);
                self.byte_code.push(ByteCode {
                    is_rom_address: false,
                    is_custom_address: index == end,
                    data: (entry.address & 0xFF) as u8,
                    address,
                });
                self.byte_code.push(ByteCode {
                    is_rom_address: false,
                    is_custom_address: false,
                    data: (entry.address >> 8) as u8,
                    address: address.wrapping_add(1),
                });
            }
        }
    }
}

impl Default for Assembler {
    fn default() -> Assembler {
        Assembler::new()
    }
}
