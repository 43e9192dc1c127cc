//! Chat-formatted prompt for query expansion.
//!
//! The same template is used for training, evaluation and the `expand`
//! command, so the policy always sees identical context.

/// Marker that ends an assistant turn.
pub const TERMINAL_MARKER: &str = "<|im_end|>";

/// Instruction sent to remote chat models, which apply their own template.
pub const EXPAND_INSTRUCTION: &str = "/no_think Expand this search query: ";

/// Build the full prompt for `query`.
pub fn build_prompt(query: &str) -> String {
    format!("<|im_start|>user\n{EXPAND_INSTRUCTION}{query}{TERMINAL_MARKER}\n<|im_start|>assistant\n")
}

/// Remove every terminal marker from `text` and trim the result.
pub fn strip_terminal_marker(text: &str) -> String {
    text.replace(TERMINAL_MARKER, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_prompt() {
        assert_eq!(
            build_prompt("auth config"),
            "<|im_start|>user\n/no_think Expand this search query: auth config<|im_end|>\n<|im_start|>assistant\n"
        );
    }

    #[test]
    fn test_strip_terminal_marker() {
        assert_eq!(strip_terminal_marker("  lex: a\n<|im_end|>"), "lex: a");
        assert_eq!(
            strip_terminal_marker("lex: a<|im_end|>\nvec: b<|im_end|>"),
            "lex: a\nvec: b"
        );
        assert_eq!(strip_terminal_marker("lex: a \n"), "lex: a");
        assert_eq!(strip_terminal_marker("<|im_end|>"), "");
    }
}
