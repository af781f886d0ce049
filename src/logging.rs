//! Pretty-printing messages to the console

use colored::Colorize;

/// Pretty-print an error message to the console
pub fn error(error_message: String) {
    let error_title = "error:".red().bold();
    eprintln!("{} {}", error_title, error_message);
}

/// Pretty-print a warning with its source position
pub fn warning(message: String, file: &str, line_number: usize) {
    let warning_title = "warning:".yellow().bold();
    eprintln!(
        "{} {} : in '{}' on line {}",
        warning_title, message, file, line_number
    );
}
