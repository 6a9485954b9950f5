/// One balanced `{ ... }` block, from its header line to its closing brace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub kind: String,
    pub start_line: u32,
    pub end_line: u32,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lexical {
    Code,
    LineComment,
    BlockComment,
    Str(char),
}

/// Extracts every balanced brace block of `source`, nested blocks included,
/// ordered by start line then by nesting depth. Comments and string literals
/// are blanked out first so braces inside them are ignored, and so the block
/// text carries code only.
pub fn extract_blocks(source: &str) -> Vec<Block> {
    let code = strip_comments_and_strings(source);
    let lines = code.lines().collect::<Vec<_>>();

    let mut open: Vec<usize> = Vec::new();
    let mut spans: Vec<(usize, usize)> = Vec::new();
    for (line_idx, line) in lines.iter().enumerate() {
        for ch in line.chars() {
            match ch {
                '{' => open.push(line_idx),
                '}' => {
                    if let Some(start) = open.pop() {
                        spans.push((start, line_idx));
                    }
                }
                _ => {}
            }
        }
    }

    let mut blocks = spans
        .into_iter()
        .map(|(brace_line, end_line)| {
            let header_line = header_line(&lines, brace_line);
            Block {
                kind: block_kind(lines[header_line]),
                start_line: to_line_number(header_line),
                end_line: to_line_number(end_line),
                text: lines[header_line..=end_line].join("\n"),
            }
        })
        .collect::<Vec<_>>();
    blocks.sort_by(|left, right| {
        left.start_line
            .cmp(&right.start_line)
            .then(right.end_line.cmp(&left.end_line))
    });
    blocks
}

/// A brace alone on its line belongs to the nearest non-blank line above it.
fn header_line(lines: &[&str], brace_line: usize) -> usize {
    if !lines[brace_line].trim_start().starts_with('{') {
        return brace_line;
    }
    (0..brace_line)
        .rev()
        .find(|idx| !lines[*idx].trim().is_empty())
        .unwrap_or(brace_line)
}

fn block_kind(header: &str) -> String {
    let trimmed = header.trim_start_matches(|c: char| c.is_whitespace() || c == '}');
    let word = trimmed
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .next()
        .unwrap_or_default();
    if word.is_empty() {
        "block".to_string()
    } else {
        word.to_string()
    }
}

fn to_line_number(idx: usize) -> u32 {
    u32::try_from(idx + 1).unwrap_or(u32::MAX)
}

/// Replaces comment bodies and string/char literal contents with spaces,
/// keeping every newline so line numbers survive.
fn strip_comments_and_strings(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut state = Lexical::Code;
    let mut chars = source.chars().peekable();

    while let Some(ch) = chars.next() {
        match state {
            Lexical::Code => match ch {
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    out.push_str("  ");
                    state = Lexical::LineComment;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    out.push_str("  ");
                    state = Lexical::BlockComment;
                }
                '"' => {
                    out.push(ch);
                    state = Lexical::Str(ch);
                }
                '\'' if closes_char_literal(chars.clone()) => {
                    out.push(ch);
                    state = Lexical::Str(ch);
                }
                _ => out.push(ch),
            },
            Lexical::LineComment => {
                if ch == '\n' {
                    out.push('\n');
                    state = Lexical::Code;
                } else {
                    out.push(' ');
                }
            }
            Lexical::BlockComment => {
                if ch == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("  ");
                    state = Lexical::Code;
                } else {
                    out.push(if ch == '\n' { '\n' } else { ' ' });
                }
            }
            Lexical::Str(quote) => match ch {
                '\\' => {
                    out.push(' ');
                    if let Some(escaped) = chars.next() {
                        out.push(if escaped == '\n' { '\n' } else { ' ' });
                    }
                }
                '\n' => {
                    // unterminated literal; recover at end of line
                    out.push('\n');
                    state = Lexical::Code;
                }
                _ if ch == quote => {
                    out.push(ch);
                    state = Lexical::Code;
                }
                _ => out.push(' '),
            },
        }
    }
    out
}

/// A quote opens a char literal only when it closes right after one char or
/// one escape (`'x'`, `'\n'`, `'\u{1F600}'`). Anything else, such as a Rust
/// lifetime or loop label, stays code.
fn closes_char_literal(mut rest: impl Iterator<Item = char>) -> bool {
    match rest.next() {
        None | Some('\n' | '\'') => false,
        Some('\\') => {
            if matches!(rest.next(), None | Some('\n')) {
                return false;
            }
            rest.take(10)
                .take_while(|ch| *ch != '\n')
                .any(|ch| ch == '\'')
        }
        Some(_) => rest.next() == Some('\''),
    }
}
