//! Operator interaction: confirmations and hidden password entry.

use std::io::{self, BufRead, Write};
use zeroize::Zeroizing;

use crate::Result;

/// Questions the pipelines ask the operator.
pub trait Prompter: Send + Sync {
    /// Yes/no question; an empty answer picks `default`.
    fn confirm(&self, question: &str, default: bool) -> Result<bool>;

    /// Hidden input. Never echoed, never logged.
    fn password(&self, prompt: &str) -> Result<Zeroizing<String>>;
}

/// Prompts on the controlling terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsolePrompter;

impl Prompter for ConsolePrompter {
    fn confirm(&self, question: &str, default: bool) -> Result<bool> {
        let hint = if default { "[Y/n]" } else { "[y/N]" };
        let stdin = io::stdin();
        loop {
            print!("{} {} ", question, hint);
            io::stdout().flush()?;

            let mut answer = String::new();
            if stdin.lock().read_line(&mut answer)? == 0 {
                return Ok(default);
            }
            match parse_answer(&answer) {
                Some(choice) => return Ok(choice),
                None if answer.trim().is_empty() => return Ok(default),
                None => println!("Please answer yes or no."),
            }
        }
    }

    fn password(&self, prompt: &str) -> Result<Zeroizing<String>> {
        Ok(Zeroizing::new(rpassword::prompt_password(prompt)?))
    }
}

fn parse_answer(answer: &str) -> Option<bool> {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}
