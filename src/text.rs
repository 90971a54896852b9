use crate::font::is_wide_char;

/// Whether two fragments need a space between them when joined on one line.
pub(crate) fn needs_space(left: &str, right: &str) -> bool {
    let last = left.chars().rev().find(|ch| !ch.is_whitespace());
    let first = right.chars().find(|ch| !ch.is_whitespace());
    match (last, first) {
        (Some(a), Some(b)) => {
            !is_wide_char(a) && !is_wide_char(b) && !binds_left(b) && !is_opening(a)
        }
        _ => false,
    }
}

pub(crate) fn join_inline(left: &str, right: &str) -> String {
    if needs_space(left, right) {
        format!("{} {}", left.trim_end(), right.trim_start())
    } else {
        format!("{}{}", left.trim_end(), right.trim_start())
    }
}

/// True when the text ends a sentence, allowing trailing closing brackets.
pub(crate) fn ends_sentence(text: &str) -> bool {
    let trimmed = text.trim_end().trim_end_matches(is_closing_bracket);
    trimmed
        .chars()
        .last()
        .is_some_and(|ch| matches!(ch, '。' | '！' | '？' | '．' | '.' | '!' | '?'))
}

pub(crate) fn is_mostly_cjk(text: &str) -> bool {
    let mut wide = 0usize;
    let mut total = 0usize;
    for ch in text.chars().filter(|ch| !ch.is_whitespace()) {
        total += 1;
        if is_wide_char(ch) {
            wide += 1;
        }
    }
    total > 0 && wide * 2 > total
}

fn is_closing_bracket(ch: char) -> bool {
    matches!(
        ch,
        ')' | ']' | '}' | '）' | '」' | '』' | '】' | '〉' | '》' | '"' | '\'' | '”' | '’'
    )
}

/// Punctuation that attaches to the preceding word.
fn binds_left(ch: char) -> bool {
    is_closing_bracket(ch) || matches!(ch, ',' | '.' | '!' | '?' | ';' | ':')
}

fn is_opening(ch: char) -> bool {
    matches!(ch, '(' | '[' | '{' | '（' | '「' | '『' | '【' | '〈' | '《' | '“' | '‘')
}
