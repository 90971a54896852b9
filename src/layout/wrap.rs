use crate::font::{FontMetrics, is_wide_char, measure_text_width_px};

/// Width measurement at one font size, including inter-glyph spacing.
#[derive(Clone, Copy)]
pub(crate) struct Measure<'a> {
    pub(crate) font: Option<&'a FontMetrics>,
    pub(crate) font_size: f32,
    pub(crate) char_spacing: f32,
}

impl Measure<'_> {
    pub(crate) fn width(&self, text: &str) -> f32 {
        let glyphs = text.chars().count();
        if glyphs == 0 {
            return 0.0;
        }
        measure_text_width_px(text, self.font_size, self.font)
            + self.char_spacing * (glyphs - 1) as f32
    }
}

/// Greedy line breaking. CJK characters break anywhere, other scripts at
/// whitespace; a `\n` always starts a new line, so blank lines survive as
/// empty entries. A single word wider than `max_width` keeps its own line.
pub(crate) fn wrap_lines(text: &str, max_width: f32, measure: &Measure<'_>) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();

    for token in tokenize_text(text) {
        match token.as_str() {
            "\n" => {
                lines.push(current.trim_end().to_string());
                current.clear();
            }
            " " => {
                if !current.is_empty() && !current.ends_with(' ') {
                    current.push(' ');
                }
            }
            _ => {
                let candidate = format!("{}{}", current, token);
                if !current.trim().is_empty() && measure.width(candidate.trim_end()) > max_width {
                    lines.push(current.trim_end().to_string());
                    current = token;
                } else {
                    current = candidate;
                }
            }
        }
    }
    if !current.trim().is_empty() {
        lines.push(current.trim_end().to_string());
    }
    lines
}

/// Split text into vertical columns of at most `max_chars` characters.
/// Whitespace at the head of a column is dropped.
pub(crate) fn split_columns(text: &str, max_chars: usize) -> Vec<Vec<char>> {
    let max_chars = max_chars.max(1);
    let mut columns = Vec::new();
    let mut current: Vec<char> = Vec::new();

    for ch in text.chars() {
        if ch == '\n' {
            columns.push(std::mem::take(&mut current));
            continue;
        }
        if ch.is_whitespace() && current.is_empty() {
            continue;
        }
        if current.len() == max_chars {
            columns.push(std::mem::take(&mut current));
            if ch.is_whitespace() {
                continue;
            }
        }
        current.push(ch);
    }
    if !current.is_empty() {
        columns.push(current);
    }
    while columns.last().is_some_and(|column| column.is_empty()) {
        columns.pop();
    }
    columns
}

/// Characters drawn turned a quarter turn inside a vertical column.
pub(crate) fn rotates_in_vertical(ch: char) -> bool {
    matches!(
        ch,
        'ー' | '－' | '—' | '―' | '–' | '-' | '~' | '～' | '…' | '‥' | '(' | ')' | '（' | '）'
            | '「' | '」' | '『' | '』' | '[' | ']' | '【' | '】' | '〈' | '〉' | '《' | '》'
    )
}

fn tokenize_text(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();

    for ch in text.chars() {
        if ch == '\n' || ch.is_whitespace() || is_wide_char(ch) {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            let token = if ch == '\n' {
                "\n".to_string()
            } else if ch.is_whitespace() {
                " ".to_string()
            } else {
                ch.to_string()
            };
            tokens.push(token);
            continue;
        }
        current.push(ch);
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measure(size: f32) -> Measure<'static> {
        Measure {
            font: None,
            font_size: size,
            char_spacing: 0.0,
        }
    }

    #[test]
    fn wraps_words_at_width() {
        // each ascii letter estimates to 0.55em
        let lines = wrap_lines("aaaa bbbb cccc", 50.0, &measure(10.0));
        assert_eq!(lines, ["aaaa bbbb", "cccc"]);
    }

    #[test]
    fn cjk_breaks_between_characters() {
        let lines = wrap_lines("吾輩は猫である", 30.0, &measure(10.0));
        assert_eq!(lines, ["吾輩は", "猫であ", "る"]);
    }

    #[test]
    fn explicit_breaks_keep_blank_lines() {
        let lines = wrap_lines("a\n\nb", 100.0, &measure(10.0));
        assert_eq!(lines, ["a", "", "b"]);
    }

    #[test]
    fn char_spacing_widens_measurement() {
        let spaced = Measure {
            char_spacing: 2.0,
            ..measure(10.0)
        };
        assert!((spaced.width("abc") - (measure(10.0).width("abc") + 4.0)).abs() < 1e-4);
    }

    #[test]
    fn columns_respect_capacity_and_breaks() {
        let columns = split_columns("あいうえお\nか", 2);
        let as_strings: Vec<String> = columns.iter().map(|c| c.iter().collect()).collect();
        assert_eq!(as_strings, ["あい", "うえ", "お", "か"]);
    }
}
