//! Positional `?` placeholder scanning.
//!
//! Statements are assembled with `?` placeholders. Question marks inside quoted
//! text (`'...'`, `"..."`, `` `...` ``) or comments (`-- ...`, `/* ... */`) are
//! not placeholders.

#[derive(Clone, Copy)]
enum State {
    Code,
    Quoted(char),
    LineComment,
    BlockComment,
}

/// Byte offsets of every `?` placeholder outside quotes and comments.
fn positions(sql: &str) -> Vec<usize> {
    let mut out = Vec::new();
    let mut state = State::Code;
    let mut chars = sql.char_indices().peekable();
    while let Some((i, ch)) = chars.next() {
        match state {
            State::Quoted(q) if ch == q => state = State::Code,
            State::Quoted(_) => {}
            State::LineComment if ch == '\n' => state = State::Code,
            State::LineComment => {}
            State::BlockComment => {
                if ch == '*' && chars.next_if(|&(_, c)| c == '/').is_some() {
                    state = State::Code;
                }
            }
            State::Code => match ch {
                '\'' | '"' | '`' => state = State::Quoted(ch),
                '-' if chars.next_if(|&(_, c)| c == '-').is_some() => state = State::LineComment,
                '/' if chars.next_if(|&(_, c)| c == '*').is_some() => state = State::BlockComment,
                '?' => out.push(i),
                _ => {}
            },
        }
    }
    out
}

/// Count `?` placeholders outside quotes and comments.
pub fn count(sql: &str) -> usize {
    positions(sql).len()
}

/// Rewrite `?` placeholders to Postgres-style `$1, $2, ...`.
pub fn to_numbered(sql: &str) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(sql.len() + 8);
    let mut last = 0;
    for (n, pos) in positions(sql).into_iter().enumerate() {
        out.push_str(&sql[last..pos]);
        let _ = write!(out, "${}", n + 1);
        last = pos + 1;
    }
    out.push_str(&sql[last..]);
    out
}
