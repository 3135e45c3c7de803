//! The reaction vocabulary the bridge understands.
//!
//! Emoji arrive either as colon-names (`thumbsup`) or as raw Unicode,
//! depending on the client that added them; every predicate accepts both.

/// Emoji the bridge seeds approval prompts with.
pub const APPROVE: &str = "+1";
pub const DENY: &str = "-1";
pub const ALLOW_ALL: &str = "white_check_mark";
pub const CANCEL: &str = "x";
pub const NUMBERS: [&str; 4] = ["one", "two", "three", "four"];

pub fn is_approval(name: &str) -> bool {
    matches!(name, "+1" | "thumbsup" | "👍")
}

pub fn is_denial(name: &str) -> bool {
    matches!(name, "-1" | "thumbsdown" | "👎")
}

/// Doubles as the "invite" reaction on message-approval prompts.
pub fn is_allow_all(name: &str) -> bool {
    matches!(name, "white_check_mark" | "heavy_check_mark" | "✅" | "✔️")
}

pub fn is_cancel(name: &str) -> bool {
    matches!(name, "x" | "octagonal_sign" | "stop_sign" | "❌" | "🛑" | "⛔")
}

pub fn is_escape(name: &str) -> bool {
    matches!(name, "double_vertical_bar" | "pause_button" | "⏸️" | "⏸")
}

/// Map a number emoji to a zero-based choice index. Only 1–4 are in the
/// vocabulary; anything else is not a choice.
pub fn number_choice(name: &str) -> Option<usize> {
    let idx = match name {
        "one" | "1️⃣" | "1⃣" => 0,
        "two" | "2️⃣" | "2⃣" => 1,
        "three" | "3️⃣" | "3⃣" => 2,
        "four" | "4️⃣" | "4⃣" => 3,
        _ => return None,
    };
    Some(idx)
}
