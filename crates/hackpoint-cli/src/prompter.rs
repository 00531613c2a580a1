//! Console implementation of Prompter for missing breakpoint handlers

use hackpoint_core::Prompter;
use std::io::{self, BufRead, Write};

/// Asks on stdin whether to continue
pub struct CliPrompter;

impl Prompter for CliPrompter {
    fn continue_without(&self, name: &str) -> bool {
        loop {
            print!("Breakpoint function '{}' not found. Continue without it? [y/n] ", name);
            io::stdout().flush().ok();
            let stdin = io::stdin();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) => return false,
                Ok(_) => {}
                Err(_) => {
                    eprintln!("Failed to read input, please try again");
                    continue;
                }
            }
            match line.trim().to_ascii_lowercase().as_str() {
                "y" | "yes" => return true,
                "n" | "no" => return false,
                _ => eprintln!("Please answer y or n"),
            }
        }
    }
}
