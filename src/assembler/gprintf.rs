//! Embedded debug prints: parsed at assembly time, rendered while the
//! emulator runs
//!
//! A `gprintf("fmt", v1, v2, ...)` line registers a record at the current
//! address. Directives support an optional zero-padded width (`%04x`) and
//! the conversions c, d, b, o/q, x and s. Variables resolve through the
//! equate/label/expression pipeline once both passes have finished; a
//! leading `*` reads the value through a 16-bit pointer in RAM.

use regex::Regex;

use super::preprocessor::LineToken;
use super::tokenizer::tokenise;
use super::{Assembler, Error};
use crate::expression::{self, ExpressionType};

/// Conversion type of one format directive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarType {
    Chr,
    Int,
    Bin,
    Oct,
    Hex,
    Str,
}

/// One variable bound to one format directive
#[derive(Debug, Clone)]
pub struct GprintfVar {
    pub indirect: bool,
    pub var_type: VarType,
    pub width: usize,
    pub data: u16,
    pub text: String,
}

/// A registered debug print
#[derive(Debug, Clone)]
pub struct Gprintf {
    pub displayed: bool,
    pub address: u16,
    pub file: String,
    pub line_number: usize,
    pub line: String,
    pub format: String,
    pub vars: Vec<GprintfVar>,
    pub subs: Vec<String>,
}

// Pairs format directives with the variable list. Directives beyond the
// last supplied variable are left unparsed, as are stray characters.
fn parse_format(format: &str, variables: &[String]) -> (Vec<GprintfVar>, Vec<String>) {
    let mut vars = Vec::new();
    let mut subs = Vec::new();

    let mut sub = String::new();
    let mut width = 0usize;
    let mut in_directive = false;
    let mut index = 0usize;

    let chars: Vec<char> = format.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if index >= variables.len() {
            break;
        }
        let chr = chars[i];
        if chr == '%' || in_directive {
            in_directive = true;
            sub.push(chr);

            if chr == '0' {
                // maximum field width of 16 digits
                let digits: String = chars[i + 1..]
                    .iter()
                    .take_while(|c| c.is_ascii_digit())
                    .collect();
                width = digits.parse::<usize>().unwrap_or(0) % 17;
            }

            let var_type = match chr {
                'c' => Some(VarType::Chr),
                'd' => Some(VarType::Int),
                'b' => Some(VarType::Bin),
                'q' | 'o' => Some(VarType::Oct),
                'x' => Some(VarType::Hex),
                's' => Some(VarType::Str),
                _ => None,
            };
            if let Some(var_type) = var_type {
                vars.push(GprintfVar {
                    indirect: false,
                    var_type,
                    width,
                    data: 0x0000,
                    text: variables[index].clone(),
                });
                index += 1;
                subs.push(std::mem::take(&mut sub));
                width = 0;
                in_directive = false;
            }
        }
        i += 1;
    }

    (vars, subs)
}

/// Returns true when the line is a gprintf directive; the record is stored
/// on the mnemonic pass only. A line mentioning gprintf that does not parse
/// is an error.
pub(super) fn create_gprintf(
    asm: &mut Assembler,
    mnemonic_pass: bool,
    line: &LineToken,
) -> Result<bool, Error> {
    if !line.text.to_uppercase().contains("GPRINTF") {
        return Ok(false);
    }

    let shape = Regex::new(r#"\(\s*"([^"]*)"([^)]*)\)"#).unwrap();
    let (file, line_number) = asm.origin(line);
    let captures = shape.captures(&line.text).ok_or_else(|| Error::BadGprintf {
        line: line.text.clone(),
        file: file.clone(),
        line_number,
    })?;

    if mnemonic_pass {
        let format = captures[1].to_string();
        let variables = tokenise(&captures[2], ',');
        let (vars, subs) = parse_format(&format, &variables);

        asm.gprintfs.push(Gprintf {
            displayed: false,
            address: asm.current_address,
            file,
            line_number,
            line: line.text.clone(),
            format,
            vars,
            subs,
        });
    }

    Ok(true)
}

/// Resolve every gprintf variable against the final symbol tables. An
/// unresolvable variable removes the record and fails the assembly.
pub(super) fn parse_gprintfs(asm: &mut Assembler) -> Result<(), Error> {
    for i in 0..asm.gprintfs.len() {
        for j in 0..asm.gprintfs[i].vars.len() {
            let mut token: String = asm.gprintfs[i].vars[j]
                .text
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();

            let mut indirect = false;
            if let Some(pos) = token.find('*') {
                indirect = true;
                token = token[pos + 1..].to_string();
            }

            let data = expression::string_to_u16(&token)
                .or_else(|| asm.evaluate_equate_operand(&token))
                .or_else(|| asm.evaluate_label_operand(&token))
                .or_else(|| match expression::is_expression(&token) {
                    ExpressionType::Valid => expression::parse(&token),
                    _ => None,
                });

            let data = match data {
                Some(data) => data,
                None => {
                    let gprintf = asm.gprintfs.remove(i);
                    return Err(Error::Unresolved {
                        token,
                        file: gprintf.file,
                        line_number: gprintf.line_number,
                    });
                }
            };

            let var = &mut asm.gprintfs[i].vars[j];
            var.indirect = indirect;
            var.text = token;
            var.data = data;
        }
    }
    Ok(())
}

fn format_var(var: &GprintfVar, read_ram: &dyn Fn(u16) -> u8) -> String {
    let data = if var.indirect {
        read_ram(var.data) as u16 | (read_ram(var.data.wrapping_add(1)) as u16) << 8
    } else {
        var.data
    };
    let width = var.width % 17;

    match var.var_type {
        VarType::Chr => char::from(data as u8).to_string(),
        VarType::Int => {
            if width > 0 {
                format!("{:0width$}", data)
            } else {
                format!("{}", data)
            }
        }
        VarType::Oct => {
            if width > 0 {
                format!("{:0width$o}", data)
            } else {
                format!("{:o}", data)
            }
        }
        VarType::Hex => {
            if width > 0 {
                format!("{:0width$x}", data)
            } else {
                format!("{:x}", data)
            }
        }
        VarType::Bin => {
            if width > 0 {
                (0..width)
                    .rev()
                    .map(|bit| if (data >> bit) & 1 == 1 { '1' } else { '0' })
                    .collect()
            } else {
                format!("{:b}", data)
            }
        }
        // strings read through the address, length byte first
        VarType::Str => {
            let address = var.data;
            let length = read_ram(address) as u16;
            (0..length)
                .map(|k| char::from(read_ram(address.wrapping_add(k + 1))))
                .collect()
        }
    }
}

/// Render one gprintf against live RAM via the supplied reader
pub fn gprintf_string(gprintf: &Gprintf, read_ram: &dyn Fn(u16) -> u8) -> String {
    let mut output = gprintf.format.clone();
    let mut sub_index = 0;
    for (i, var) in gprintf.vars.iter().enumerate() {
        let rendered = format_var(var, read_ram);
        if let Some(pos) = output[sub_index..]
            .find(&gprintf.subs[i])
            .map(|p| p + sub_index)
        {
            output.replace_range(pos..pos + gprintf.subs[i].len(), &rendered);
            sub_index = pos;
        }
    }
    output
}

/// Fire any gprintf registered at the current vCPU program counter, at most
/// once per visit. The program counter and all operands are read through
/// `read_ram`.
pub fn print_gprintfs(asm: &mut Assembler, read_ram: &dyn Fn(u16) -> u8) {
    if asm.gprintfs.is_empty() {
        return;
    }
    let vpc = (read_ram(super::VPC_HI) as u16) << 8 | read_ram(super::VPC_LO) as u16;

    for i in 0..asm.gprintfs.len() {
        if vpc == asm.gprintfs[i].address {
            if !asm.gprintfs[i].displayed {
                let text = gprintf_string(&asm.gprintfs[i], read_ram);
                eprintln!(
                    "gprintf : address ${:04X} : '{}'",
                    asm.gprintfs[i].address, text
                );
                asm.gprintfs[i].displayed = true;
            }
        } else {
            asm.gprintfs[i].displayed = false;
        }
    }
}
