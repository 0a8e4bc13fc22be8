//! Strength rules for encryption secrets.

use crate::{Result, StashError};

pub const MIN_PASSWORD_LENGTH: usize = 12;

/// Password shown in the documentation; refusing it keeps copy-paste setups honest.
pub const EXAMPLE_PASSWORD: &str = "MyS3cureB@ckup2024!";

const WEAK_WORDS: &[&str] = &[
    "password", "123456", "qwerty", "admin", "login", "welcome", "monkey", "dragon", "master",
    "shadow", "letmein", "football", "baseball", "superman", "batman", "trustno1", "hello",
    "world", "computer", "internet",
];

/// Check an encryption secret. An empty secret disables encryption and is accepted.
pub fn validate_password(password: &str) -> Result<()> {
    if password.is_empty() {
        return Ok(());
    }
    if password == EXAMPLE_PASSWORD {
        return Err(StashError::Validation(format!(
            "the example password '{}' is not allowed, choose your own",
            EXAMPLE_PASSWORD
        )));
    }

    let issues = password_issues(password);
    if issues.is_empty() {
        return Ok(());
    }

    Err(StashError::Validation(format!(
        "encryption password does not meet the requirements:\n  - {}",
        issues.join("\n  - ")
    )))
}

fn password_issues(password: &str) -> Vec<String> {
    let mut issues = Vec::new();

    let length = password.chars().count();
    if length < MIN_PASSWORD_LENGTH {
        issues.push(format!(
            "too short ({} chars), at least {} required",
            length, MIN_PASSWORD_LENGTH
        ));
    }

    if !password.chars().any(char::is_uppercase) {
        issues.push("missing uppercase letters".to_string());
    }
    if !password.chars().any(char::is_lowercase) {
        issues.push("missing lowercase letters".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        issues.push("missing digits".to_string());
    }
    if !password
        .chars()
        .any(|c| !c.is_alphanumeric() && !c.is_whitespace())
    {
        issues.push("missing special characters".to_string());
    }

    if has_weak_word(password) || has_repeated_run(password) || has_ascending_triple(password) {
        issues.push("contains common words or simple patterns".to_string());
    }

    issues
}

fn has_weak_word(password: &str) -> bool {
    let lower = password.to_lowercase();
    WEAK_WORDS.iter().any(|word| lower.contains(word))
}

/// Four or more identical characters in a row.
fn has_repeated_run(password: &str) -> bool {
    let chars: Vec<char> = password.chars().collect();
    chars
        .windows(4)
        .any(|w| w[1] == w[0] && w[2] == w[0] && w[3] == w[0])
}

/// `123`, `789`, `890`, `abc`, `XYZ` and so on.
fn has_ascending_triple(password: &str) -> bool {
    let chars: Vec<char> = password.to_ascii_lowercase().chars().collect();
    chars.windows(3).any(|w| {
        if w.iter().all(|c| c.is_ascii_digit()) {
            let d: Vec<u32> = w.iter().filter_map(|c| c.to_digit(10)).collect();
            d[1] == (d[0] + 1) % 10 && d[2] == (d[1] + 1) % 10 && d[0] != 9
        } else if w.iter().all(|c| c.is_ascii_lowercase()) {
            w[1] as u32 == w[0] as u32 + 1 && w[2] as u32 == w[1] as u32 + 1
        } else {
            false
        }
    })
}
