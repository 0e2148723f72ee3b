//! Quote-aware line scanning shared by separator detection and the
//! unclosed-quote check in the stream parser.

/// Counts `separator` occurrences outside quoted spans. A quote character
/// repeated twice inside a span is an escaped literal.
pub fn count_unquoted(line: &str, separator: char, quotes: &[char]) -> usize {
    let mut count = 0;
    scan(line, quotes, |c| {
        if c == separator {
            count += 1;
        }
    });
    count
}

/// True when a quoted span opened on this line is never closed.
pub fn has_unclosed_quote(line: &str, quotes: &[char]) -> bool {
    scan(line, quotes, |_| {})
}

/// Walks `line`, calling `visit` for every character outside quotes.
/// Returns whether the line ends inside a quoted span.
fn scan(line: &str, quotes: &[char], mut visit: impl FnMut(char)) -> bool {
    let mut open: Option<char> = None;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match open {
            Some(q) if c == q => {
                if chars.peek() == Some(&q) {
                    chars.next();
                } else {
                    open = None;
                }
            }
            Some(_) => {}
            None if quotes.contains(&c) => open = Some(c),
            None => visit(c),
        }
    }

    open.is_some()
}
