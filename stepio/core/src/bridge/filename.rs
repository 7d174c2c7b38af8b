//! Output file name patterns
//!
//! | Token | Expands to                         |
//! |-------|------------------------------------|
//! | `%t`  | global task id                     |
//! | `%n`  | node id                            |
//! | `%N`  | node hostname                      |
//! | `%j`  | job id                             |
//! | `%s`  | step id                            |
//! | `%%`  | a literal `%`                      |
//!
//! A decimal width between `%` and the letter zero-pads numbers (`%3t` ->
//! `007`). Unknown tokens are copied through unchanged.
//!
//! The tokens present decide how many files a pattern opens: any `%t` gives
//! one file per task, otherwise `%n`/`%N` gives one per node, otherwise the
//! whole step shares a single file.

/// How many files a pattern expands to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PatternScope {
    Single,
    PerNode,
    PerTask,
}

/// Values substituted into a pattern
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct NameFields<'a> {
    pub task: Option<u32>,
    pub node: Option<u32>,
    pub hostname: Option<&'a str>,
    pub job_id: u32,
    pub step_id: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct NamePattern {
    raw: String,
}

enum Piece<'a> {
    Literal(&'a str),
    Token { width: usize, key: char, raw: &'a str },
}

impl NamePattern {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn scope(&self) -> PatternScope {
        let keys: Vec<char> = self
            .pieces()
            .filter_map(|piece| match piece {
                Piece::Token { key, .. } => Some(key),
                Piece::Literal(_) => None,
            })
            .collect();

        if keys.contains(&'t') {
            PatternScope::PerTask
        } else if keys.contains(&'n') || keys.contains(&'N') {
            PatternScope::PerNode
        } else {
            PatternScope::Single
        }
    }

    pub fn expand(&self, fields: &NameFields<'_>) -> String {
        let mut out = String::with_capacity(self.raw.len() + 8);
        for piece in self.pieces() {
            match piece {
                Piece::Literal(text) => out.push_str(text),
                Piece::Token { width, key, raw } => {
                    let number = match key {
                        't' => fields.task,
                        'n' => fields.node,
                        'j' => Some(fields.job_id),
                        's' => Some(fields.step_id),
                        'N' => {
                            out.push_str(fields.hostname.unwrap_or(raw));
                            continue;
                        }
                        '%' => {
                            out.push('%');
                            continue;
                        }
                        _ => None,
                    };
                    match number {
                        Some(n) => out.push_str(&format!("{n:0width$}")),
                        None => out.push_str(raw),
                    }
                }
            }
        }
        out
    }

    fn pieces(&self) -> impl Iterator<Item = Piece<'_>> {
        let raw = self.raw.as_str();
        let mut pos = 0;
        std::iter::from_fn(move || {
            if pos >= raw.len() {
                return None;
            }
            let rest = &raw[pos..];
            if !rest.starts_with('%') {
                let end = rest.find('%').unwrap_or(rest.len());
                pos += end;
                return Some(Piece::Literal(&rest[..end]));
            }

            let digits = rest[1..].bytes().take_while(u8::is_ascii_digit).count();
            let Some(key) = rest[1 + digits..].chars().next() else {
                // Trailing '%' or '%<digits>' with nothing after
                pos = raw.len();
                return Some(Piece::Literal(rest));
            };
            let end = 1 + digits + key.len_utf8();
            let width = rest[1..1 + digits].parse().unwrap_or(0);
            pos += end;
            Some(Piece::Token {
                width,
                key,
                raw: &rest[..end],
            })
        })
    }
}
