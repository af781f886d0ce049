//! Source preprocessing: file inclusion and parameterized macros
//!
//! Runs before the two passes. `%include` lines are replaced in place by
//! the (recursively flattened) contents of the named file. `%MACRO name
//! p1 p2 ...` up to `%ENDM` defines a macro; definitions are removed from
//! the stream and every invocation is expanded with its labels made unique
//! per invocation.

use std::fs;

use super::tokenizer::tokenise_line;
use super::{strip_label_colon, Error};
use crate::logging;

/// One source line tagged with its origin for diagnostics
#[derive(Debug, Clone, Default)]
pub struct LineToken {
    pub text: String,
    pub from_include: bool,
    pub include_name: String,
    pub include_line: usize,
    /// 1-based line within the file the text came from
    pub line_number: usize,
}

#[derive(Debug, Clone, Default)]
struct Macro {
    name: String,
    params: Vec<String>,
    lines: Vec<String>,
    complete: bool,
    file_name: String,
    file_line: usize,
    // definition range in the line stream
    start: usize,
    end: usize,
}

fn origin_of(line: &LineToken, file_name: &str) -> (String, usize) {
    if line.from_include {
        (line.include_name.clone(), line.include_line)
    } else {
        (file_name.to_string(), line.line_number)
    }
}

fn handle_include(
    include_path: &str,
    tokens: &[String],
    line: &LineToken,
    file_name: &str,
) -> Result<Vec<LineToken>, Error> {
    if tokens.len() != 2 {
        let (file, line_number) = origin_of(line, file_name);
        return Err(Error::BadInclude {
            line: line.text.clone(),
            file,
            line_number,
        });
    }

    // the tokenizer keeps quotes on the path argument
    let name = tokens[1].trim_matches(|c: char| c == '"' || c == '\'');
    let filepath = format!("{}{}", include_path, name).replace('\\', "/");
    let source = fs::read_to_string(&filepath).map_err(|_| Error::ReadError {
        path: filepath.clone(),
    })?;

    Ok(source
        .lines()
        .enumerate()
        .map(|(index, text)| LineToken {
            text: text.to_string(),
            from_include: true,
            include_name: filepath.clone(),
            include_line: index + 1,
            line_number: index + 1,
        })
        .collect())
}

/// Resolve `%include` lines, collect and expand macros. Include files are
/// flattened recursively; their macro definitions are picked up by the
/// top-level scan.
pub(super) fn preprocess(
    include_path: &str,
    file_name: &str,
    lines: &mut Vec<LineToken>,
    do_macros: bool,
) -> Result<(), Error> {
    let mut macros: Vec<Macro> = Vec::new();
    let mut building: Option<Macro> = None;

    let mut index = 0;
    while index < lines.len() {
        let line = lines[index].clone();
        if line.text.trim().is_empty() {
            index += 1;
            continue;
        }

        let tokens = tokenise_line(&line.text);
        let first = tokens
            .first()
            .map(|t| t.to_uppercase())
            .unwrap_or_default();

        if first == "%INCLUDE" {
            let mut included = handle_include(include_path, &tokens, &line, file_name)?;
            // flatten nested includes before splicing them in
            preprocess(include_path, file_name, &mut included, false)?;
            lines.splice(index..=index, included);
            // rescan from the first included line
            continue;
        }

        if do_macros {
            if first == "%MACRO" {
                let (file, line_number) = origin_of(&line, file_name);
                if building.is_some() {
                    return Err(Error::BadMacro {
                        reason: "macros must not nest".to_string(),
                        name: tokens.get(1).cloned().unwrap_or_default(),
                        file,
                        line_number,
                    });
                }
                if tokens.len() < 2 {
                    return Err(Error::BadMacro {
                        reason: "missing name".to_string(),
                        name: String::new(),
                        file,
                        line_number,
                    });
                }
                building = Some(Macro {
                    name: tokens[1].clone(),
                    params: tokens[2..].to_vec(),
                    file_name: file,
                    file_line: line_number,
                    start: index,
                    ..Default::default()
                });
            } else if first == "%ENDM" && building.is_some() {
                let mut done = building.take().unwrap();
                done.end = index;
                done.complete = true;
                if macros.iter().any(|m| m.name == done.name) {
                    return Err(Error::Duplicate {
                        name: done.name.clone(),
                        line: line.text.clone(),
                        file: done.file_name.clone(),
                        line_number: done.file_line,
                    });
                }
                macros.push(done);
            } else if let Some(building) = building.as_mut() {
                building.lines.push(line.text.clone());
            }
        }

        index += 1;
    }

    if let Some(unterminated) = building {
        return Err(Error::BadMacro {
            reason: "missing %ENDM".to_string(),
            name: unterminated.name,
            file: unterminated.file_name,
            line_number: unterminated.file_line,
        });
    }

    if do_macros {
        // remove the definitions, then expand invocations
        for done in macros.iter().rev() {
            lines.drain(done.start..=done.end);
        }
        expand_macros(&macros, lines)?;
    }

    Ok(())
}

fn expand_macros(macros: &[Macro], lines: &mut Vec<LineToken>) -> Result<(), Error> {
    let mut instance_id = 0usize;

    for mac in macros {
        let mut found = false;
        let mut invoked = false;

        let mut index = 0;
        while index < lines.len() {
            let line = lines[index].clone();
            if line.text.trim().is_empty() {
                index += 1;
                continue;
            }
            let tokens = tokenise_line(&line.text);
            let at = match tokens.iter().position(|token| *token == mac.name) {
                Some(at) => at,
                None => {
                    index += 1;
                    continue;
                }
            };
            found = true;
            if tokens.len() - at <= mac.params.len() {
                index += 1;
                continue;
            }
            invoked = true;

            let expanded = expand_one(mac, &tokens, at, &line, instance_id);
            instance_id += 1;
            let count = expanded.len();
            lines.splice(index..=index, expanded);
            index += count;
        }

        if !found {
            logging::warning(
                format!("macro is never called : '{}'", mac.name),
                &mac.file_name,
                mac.file_line,
            );
            continue;
        }
        if !invoked {
            return Err(Error::BadMacro {
                reason: "missing macro parameters".to_string(),
                name: mac.name.clone(),
                file: mac.file_name.clone(),
                line_number: mac.file_line,
            });
        }
    }

    Ok(())
}

fn expand_one(
    mac: &Macro,
    tokens: &[String],
    at: usize,
    invocation: &LineToken,
    instance_id: usize,
) -> Vec<LineToken> {
    let mut labels: Vec<String> = Vec::new();
    let mut expanded: Vec<LineToken> = Vec::new();

    for (body_index, body) in mac.lines.iter().enumerate() {
        let body_tokens = tokenise_line(body);
        let has_label = body
            .chars()
            .next()
            .is_some_and(|c| !c.is_whitespace());
        if has_label {
            if let Some(first) = body_tokens.first() {
                labels.push(strip_label_colon(first).to_string());
            }
        }

        // substitute parameters with invocation arguments
        let substituted: Vec<String> = body_tokens
            .iter()
            .map(|token| {
                mac.params
                    .iter()
                    .position(|param| param == token)
                    .map(|p| tokens[at + 1 + p].clone())
                    .unwrap_or_else(|| token.clone())
            })
            .collect();

        // a label on the invocation line moves onto the first expanded line
        let mut text = if at > 0 && body_index == 0 {
            tokens[0].clone()
        } else {
            String::new()
        };
        for (k, token) in substituted.iter().enumerate() {
            if !(has_label && k == 0) {
                text.push(' ');
            }
            text.push_str(token);
        }

        expanded.push(LineToken {
            text,
            ..invocation.clone()
        });
    }

    // hygiene: make this invocation's labels unique
    for line in &mut expanded {
        for label in &labels {
            append_instance_id(&mut line.text, label, instance_id);
        }
    }

    expanded
}

// Appends the id to every occurrence of the label text, position ordered
fn append_instance_id(text: &mut String, label: &str, instance_id: usize) {
    let id = instance_id.to_string();
    let mut from = 0;
    while let Some(pos) = text[from..].find(label).map(|p| p + from) {
        text.insert_str(pos + label.len(), &id);
        from = pos + label.len() + id.len();
    }
}
