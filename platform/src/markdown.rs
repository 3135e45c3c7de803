/// Per-dialect message formatting. Backends differ in how (and whether)
/// they render markdown; everything user-visible goes through this trait so
/// the core never hardcodes a dialect.
pub trait MessageFormatter: Send + Sync {
    fn bold(&self, s: &str) -> String;
    fn italic(&self, s: &str) -> String;
    fn code(&self, s: &str) -> String;
    fn code_block(&self, s: &str, lang: &str) -> String;
    fn mention(&self, username: &str) -> String;
    fn link(&self, label: &str, url: &str) -> String;
    fn quote(&self, s: &str) -> String;
    fn heading(&self, s: &str) -> String;
    /// Escape characters the dialect would otherwise interpret.
    fn escape(&self, s: &str) -> String;
}

/// Mattermost-flavored markdown.
pub struct MattermostFormatter;

impl MessageFormatter for MattermostFormatter {
    fn bold(&self, s: &str) -> String {
        format!("**{s}**")
    }

    fn italic(&self, s: &str) -> String {
        format!("*{s}*")
    }

    fn code(&self, s: &str) -> String {
        format!("`{s}`")
    }

    fn code_block(&self, s: &str, lang: &str) -> String {
        format!("```{lang}\n{s}\n```")
    }

    fn mention(&self, username: &str) -> String {
        format!("@{username}")
    }

    fn link(&self, label: &str, url: &str) -> String {
        format!("[{label}]({url})")
    }

    fn quote(&self, s: &str) -> String {
        s.lines()
            .map(|line| format!("> {line}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn heading(&self, s: &str) -> String {
        format!("#### {s}")
    }

    fn escape(&self, s: &str) -> String {
        let mut out = String::with_capacity(s.len());
        for c in s.chars() {
            if matches!(c, '*' | '_' | '`' | '~' | '[' | ']' | '|' | '>') {
                out.push('\\');
            }
            out.push(c);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn mattermost_dialect() {
        let f = MattermostFormatter;
        assert_eq!(f.bold("x"), "**x**");
        assert_eq!(f.italic("x"), "*x*");
        assert_eq!(f.code("x"), "`x`");
        assert_eq!(f.code_block("let a;", "rust"), "```rust\nlet a;\n```");
        assert_eq!(f.mention("alice"), "@alice");
        assert_eq!(f.link("docs", "https://x"), "[docs](https://x)");
        assert_eq!(f.quote("a\nb"), "> a\n> b");
        assert_eq!(f.heading("h"), "#### h");
    }

    #[test]
    fn escape_neutralizes_markup() {
        let f = MattermostFormatter;
        assert_eq!(f.escape("a*b_c`d"), "a\\*b\\_c\\`d");
        assert_eq!(f.escape("plain"), "plain");
    }
}
