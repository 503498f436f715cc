//! File-block grammar for backend output
//!
//! Backends answer with labeled file blocks:
//!
//! ```text
//! --- FILE: src/handler.ts ---
//! export const handler = () => {}
//! --- END FILE ---
//! ```
//!
//! Parsing is two-stage: [`tokenize`] classifies every line as a start
//! marker, an end marker, or text, and [`parse_blocks`] runs a two-state
//! machine (outside / inside a block) over the tokens. Malformed input never
//! fails the parse; it produces [`BlockDiagnostic`]s and fewer blocks. Zero
//! blocks is a valid result.

use crate::file::FileBlock;
use std::collections::HashMap;
use std::fmt;

const START_PREFIX: &str = "--- FILE:";
const MARKER_SUFFIX: &str = "---";
const END_MARKER: &str = "--- END FILE ---";

/// Classified line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind<'a> {
    /// `--- FILE: <path> ---` (path already trimmed, may be empty)
    Start(&'a str),
    /// `--- END FILE ---`
    End,
    /// Any other line, verbatim
    Text(&'a str),
}

/// A token with its 1-based line number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    /// 1-based line number in the input
    pub line: usize,
    /// Token classification
    pub kind: TokenKind<'a>,
}

/// Split input into line tokens
pub fn tokenize(input: &str) -> impl Iterator<Item = Token<'_>> {
    input.lines().enumerate().map(|(idx, raw)| Token {
        line: idx + 1,
        kind: classify(raw),
    })
}

fn classify(raw: &str) -> TokenKind<'_> {
    let trimmed = raw.trim();
    if trimmed == END_MARKER {
        return TokenKind::End;
    }
    if let Some(rest) = trimmed.strip_prefix(START_PREFIX) {
        if let Some(path) = rest.strip_suffix(MARKER_SUFFIX) {
            return TokenKind::Start(path.trim());
        }
    }
    TokenKind::Text(raw)
}

/// Non-fatal observation made while parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockDiagnostic {
    /// Block opened but never closed; its content was dropped
    Unterminated {
        /// Path of the dropped block
        path: String,
        /// Line of its start marker
        line: usize,
    },
    /// Start marker without a path; block skipped
    EmptyPath {
        /// Line of the start marker
        line: usize,
    },
    /// Path seen more than once; the later block wins
    DuplicatePath {
        /// Repeated path
        path: String,
        /// Line of the later start marker
        line: usize,
    },
    /// End marker outside any block; ignored
    StrayEnd {
        /// Line of the end marker
        line: usize,
    },
}

impl fmt::Display for BlockDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unterminated { path, line } => {
                write!(f, "line {line}: block '{path}' is not terminated")
            }
            Self::EmptyPath { line } => write!(f, "line {line}: file block without a path"),
            Self::DuplicatePath { path, line } => {
                write!(f, "line {line}: duplicate block for '{path}'")
            }
            Self::StrayEnd { line } => write!(f, "line {line}: end marker outside a block"),
        }
    }
}

/// Result of parsing backend output
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedBlocks {
    /// Complete blocks in first-seen path order
    pub blocks: Vec<FileBlock>,
    /// Everything that was dropped or overridden
    pub diagnostics: Vec<BlockDiagnostic>,
}

impl ParsedBlocks {
    /// No complete block was found
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Number of complete blocks
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Output contained blocks, but some were malformed
    #[inline]
    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.diagnostics.is_empty()
    }
}

enum State<'a> {
    Outside,
    Inside {
        path: &'a str,
        line: usize,
        lines: Vec<&'a str>,
    },
}

/// Parse backend output into file blocks
#[must_use]
pub fn parse_blocks(input: &str) -> ParsedBlocks {
    let mut out = ParsedBlocks::default();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut state = State::Outside;

    for token in tokenize(input) {
        state = match (state, token.kind) {
            (State::Outside, TokenKind::Start(path)) => open(path, token.line, &mut out),
            (State::Outside, TokenKind::End) => {
                out.diagnostics.push(BlockDiagnostic::StrayEnd { line: token.line });
                State::Outside
            }
            (State::Outside, TokenKind::Text(_)) => State::Outside,
            (State::Inside { path, line, .. }, TokenKind::Start(next)) => {
                unterminated(path, line, &mut out);
                open(next, token.line, &mut out)
            }
            (State::Inside { path, line, lines }, TokenKind::End) => {
                close(path, line, &lines, &mut out, &mut index);
                State::Outside
            }
            (State::Inside { path, line, mut lines }, TokenKind::Text(text)) => {
                lines.push(text);
                State::Inside { path, line, lines }
            }
        };
    }

    if let State::Inside { path, line, .. } = state {
        unterminated(path, line, &mut out);
    }

    if !out.diagnostics.is_empty() {
        tracing::debug!(
            blocks = out.blocks.len(),
            diagnostics = out.diagnostics.len(),
            "file block output was partially malformed"
        );
    }

    out
}

fn open<'a>(path: &'a str, line: usize, out: &mut ParsedBlocks) -> State<'a> {
    // A pathless block is still entered so its end marker is not reported
    // as stray; `close` discards it.
    if path.is_empty() {
        out.diagnostics.push(BlockDiagnostic::EmptyPath { line });
    }
    State::Inside {
        path,
        line,
        lines: Vec::new(),
    }
}

fn unterminated(path: &str, line: usize, out: &mut ParsedBlocks) {
    if !path.is_empty() {
        out.diagnostics.push(BlockDiagnostic::Unterminated {
            path: path.to_string(),
            line,
        });
    }
}

fn close(
    path: &str,
    line: usize,
    lines: &[&str],
    out: &mut ParsedBlocks,
    index: &mut HashMap<String, usize>,
) {
    if path.is_empty() {
        return;
    }

    let mut content = lines.join("\n");
    if !lines.is_empty() {
        content.push('\n');
    }

    if let Some(&slot) = index.get(path) {
        out.diagnostics.push(BlockDiagnostic::DuplicatePath {
            path: path.to_string(),
            line,
        });
        out.blocks[slot].content = content;
    } else {
        index.insert(path.to_string(), out.blocks.len());
        out.blocks.push(FileBlock::new(path, content));
    }
}

/// Render files in the same grammar, e.g. to show a backend the current code
#[must_use]
pub fn render_blocks<'a, I>(files: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out = String::new();
    for (path, content) in files {
        out.push_str(START_PREFIX);
        out.push(' ');
        out.push_str(path);
        out.push(' ');
        out.push_str(MARKER_SUFFIX);
        out.push('\n');
        out.push_str(content);
        if !content.is_empty() && !content.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(END_MARKER);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn tokenizer_classifies_lines() {
        let input = "intro\n--- FILE: a.ts ---\nbody\n  --- END FILE ---  \n";
        let kinds: Vec<_> = tokenize(input).map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Text("intro"),
                TokenKind::Start("a.ts"),
                TokenKind::Text("body"),
                TokenKind::End,
            ]
        );
    }

    #[test]
    fn parses_multiple_blocks_ignoring_prose() {
        let input = "Here are the fixes:\n\
                     --- FILE: src/a.ts ---\n\
                     export const a = 1;\n\
                     --- END FILE ---\n\
                     and another\n\
                     --- FILE: src/b.ts ---\n\
                     line one\n\
                     \n\
                     line three\n\
                     --- END FILE ---\n";
        let parsed = parse_blocks(input);

        assert!(!parsed.is_partial());
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.blocks[0], FileBlock::new("src/a.ts", "export const a = 1;\n"));
        assert_eq!(parsed.blocks[1].content, "line one\n\nline three\n");
    }

    #[test]
    fn zero_matches_is_empty_not_error() {
        let parsed = parse_blocks("I could not produce any code this time.");
        assert!(parsed.is_empty());
        assert!(parsed.diagnostics.is_empty());
    }

    #[test]
    fn unterminated_block_at_eof_is_dropped() {
        let input = "--- FILE: ok.ts ---\nfine\n--- END FILE ---\n--- FILE: cut.ts ---\nhalf";
        let parsed = parse_blocks(input);

        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed.blocks[0].path, "ok.ts");
        assert_eq!(
            parsed.diagnostics,
            vec![BlockDiagnostic::Unterminated {
                path: "cut.ts".into(),
                line: 4
            }]
        );
    }

    #[test]
    fn start_inside_block_drops_the_open_block() {
        let input = "--- FILE: a.ts ---\nx\n--- FILE: b.ts ---\ny\n--- END FILE ---\n";
        let parsed = parse_blocks(input);

        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed.blocks[0], FileBlock::new("b.ts", "y\n"));
        assert!(matches!(
            parsed.diagnostics[0],
            BlockDiagnostic::Unterminated { ref path, line: 1 } if path == "a.ts"
        ));
    }

    #[test]
    fn empty_path_and_stray_end_are_reported() {
        let input = "--- END FILE ---\n--- FILE:  ---\nlost\n--- END FILE ---\n";
        let parsed = parse_blocks(input);

        assert!(parsed.is_empty());
        assert_eq!(
            parsed.diagnostics,
            vec![
                BlockDiagnostic::StrayEnd { line: 1 },
                BlockDiagnostic::EmptyPath { line: 2 },
            ]
        );
    }

    #[test]
    fn duplicate_path_keeps_last_block() {
        let input = "--- FILE: a.ts ---\nold\n--- END FILE ---\n--- FILE: a.ts ---\nnew\n--- END FILE ---\n";
        let parsed = parse_blocks(input);

        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed.blocks[0].content, "new\n");
        assert!(matches!(parsed.diagnostics[0], BlockDiagnostic::DuplicatePath { .. }));
    }

    #[test]
    fn rendered_blocks_parse_back() {
        let rendered = render_blocks([("a.ts", "one\ntwo"), ("b/c.py", "print(1)\n")]);
        let parsed = parse_blocks(&rendered);

        assert_eq!(
            parsed.blocks,
            vec![
                FileBlock::new("a.ts", "one\ntwo\n"),
                FileBlock::new("b/c.py", "print(1)\n"),
            ]
        );
    }

    #[test]
    fn crlf_input_is_accepted() {
        let parsed = parse_blocks("--- FILE: a.ts ---\r\nx\r\n--- END FILE ---\r\n");
        assert_eq!(parsed.blocks, vec![FileBlock::new("a.ts", "x\n")]);
    }
}
