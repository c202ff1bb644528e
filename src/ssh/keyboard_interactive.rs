//! Keyboard-Interactive Authentication (OTP / 2FA)
//!
//! The server sends info-request rounds, each carrying zero or more prompts.
//! A one-time code is entered once by the user and used to answer every
//! prompt of every round.

use serde::{Deserialize, Serialize};

/// Info-request rounds answered before giving up
pub const MAX_KBI_ROUNDS: usize = 8;

/// Keyboard-Interactive prompt from server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KbiPrompt {
    /// The prompt text to display
    pub prompt: String,
    /// true = show input (echo), false = mask input (password-style)
    pub echo: bool,
}

/// One response per prompt, all set to `secret`.
pub fn answer_all(prompts: &[KbiPrompt], secret: &str) -> Vec<String> {
    prompts.iter().map(|_| secret.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_answer_all() {
        let prompts = vec![
            KbiPrompt {
                prompt: "Password: ".into(),
                echo: false,
            },
            KbiPrompt {
                prompt: "Verification code: ".into(),
                echo: true,
            },
        ];
        assert_eq!(answer_all(&prompts, "123456"), vec!["123456", "123456"]);
        assert!(answer_all(&[], "x").is_empty());
    }
}
