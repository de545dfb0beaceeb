//! Token reader over a read-only memory-mapped file.
//!
//! The reader exposes the file as lines of whitespace-separated tokens.
//! Tokens are `(offset, length)` views into the mapping and never own
//! character data; a [`Line`] therefore borrows the reader that produced
//! it.

use err_derive::Error;
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error(display = "IO error: {}", _0)]
    Io(#[error(source)] std::io::Error),

    #[error(display = "file {} is too large for the reader", _0)]
    TooLarge(String),
}

/// Parsing switches of the reader.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReaderOptions {
    /// Skip lines that contain no tokens.
    pub ignore_empty_lines: bool,
    /// Lines starting with `#` are elided.
    pub allow_comments: bool,
    /// Newlines count as regular whitespace; the whole file becomes one
    /// virtual line.
    pub ignore_line_ends: bool,
}

/// Reference to one token inside the mapped file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenRef {
    /// Byte offset of the token in the file.
    pub offset: u32,
    /// Token length in bytes.
    pub length: u32,
    /// 1-based line number.
    pub line: u32,
    /// 1-based column of the first token character.
    pub column: u32,
}

/// One parsed line of tokens, borrowing the underlying mapping.
#[derive(Debug)]
pub struct Line<'a> {
    data: &'a [u8],
    line_number: u32,
    tokens: Vec<TokenRef>,
}

impl<'a> Line<'a> {
    /// Line number of the first token (or of the position where parsing
    /// started for an empty line).
    pub fn line_number(&self) -> u32 {
        self.line_number
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[TokenRef] {
        &self.tokens
    }

    /// Raw bytes of the `idx`-th token.
    pub fn token_bytes(&self, idx: usize) -> &'a [u8] {
        let t = &self.tokens[idx];
        &self.data[t.offset as usize..(t.offset + t.length) as usize]
    }

    /// The `idx`-th token as a string slice (tokens are required to be
    /// valid UTF-8 only when interpreted; invalid bytes are replaced).
    pub fn token_str(&self, idx: usize) -> std::borrow::Cow<'a, str> {
        String::from_utf8_lossy(self.token_bytes(idx))
    }
}

/// Sequential tokenizing reader over a memory-mapped file.
pub struct Reader {
    // `None` for zero-length files, which cannot be mapped.
    map: Option<Mmap>,
    opts: ReaderOptions,
    len: u32,
    offset: u32,
    line_number: u32,
    line_offset: u32,
}

impl Reader {
    /// Map `path` read-only and initialize the reader.
    ///
    /// Offsets are 32-bit; larger files are rejected rather than silently
    /// truncated.
    pub fn open(path: &Path, opts: ReaderOptions) -> Result<Reader, ReaderError> {
        let file = File::open(path)?;
        let meta = file.metadata()?;
        if meta.len() > u32::MAX as u64 {
            return Err(ReaderError::TooLarge(path.display().to_string()));
        }
        let map = if meta.len() == 0 {
            None
        } else {
            // Safety: the mapping is read-only and private to this reader.
            Some(unsafe { Mmap::map(&file)? })
        };
        let len = meta.len() as u32;
        Ok(Reader {
            map,
            opts,
            len,
            offset: 0,
            line_number: 1,
            line_offset: 0,
        })
    }

    fn data(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    /// Fault in the mapping by touching one byte per 4 KiB page.
    pub fn populate(&self) {
        let data = self.data();
        let mut sum = 0u8;
        let mut i = 0usize;
        while i < data.len() {
            sum = sum.wrapping_add(data[i]);
            i += 4096;
        }
        std::hint::black_box(sum);
    }

    pub fn eof(&self) -> bool {
        self.offset >= self.len
    }

    fn at(&self) -> u8 {
        self.data()[self.offset as usize]
    }

    fn eol(&self) -> bool {
        !self.eof() && self.at() == b'\n'
    }

    fn skip_whitespace(&mut self) {
        while !self.eof() && !self.eol() && self.at().is_ascii_whitespace() {
            self.offset += 1;
        }
    }

    fn skip_token(&mut self) {
        while !self.eof() && !self.at().is_ascii_whitespace() {
            self.offset += 1;
        }
    }

    fn skip_rest_of_line(&mut self) {
        while !self.eof() && !self.eol() {
            self.offset += 1;
        }
        if !self.eof() {
            self.offset += 1; // the newline itself
        }
        self.line_number += 1;
        self.line_offset = self.offset;
    }

    fn is_comment_start(&self) -> bool {
        self.opts.allow_comments && !self.eof() && self.at() == b'#'
    }

    fn is_token_start(&self) -> bool {
        !self.eof() && !self.at().is_ascii_whitespace() && !self.is_comment_start()
    }

    /// Parse one line of tokens. When line ends are ignored the entire
    /// file is consumed into a single line. Returns `None` at end of file.
    pub fn read_line(&mut self) -> Option<Line<'_>> {
        if self.eof() {
            return None;
        }

        let mut line_number = self.line_number;
        let mut tokens: Vec<TokenRef> = Vec::new();
        while !self.eof() {
            self.skip_whitespace();

            if self.is_token_start() {
                if tokens.is_empty() {
                    line_number = self.line_number;
                }
                let start = self.offset;
                self.skip_token();
                tokens.push(TokenRef {
                    offset: start,
                    length: self.offset - start,
                    line: self.line_number,
                    column: start - self.line_offset + 1,
                });
                continue;
            }

            if self.is_comment_start() {
                self.skip_rest_of_line();
                if self.opts.ignore_line_ends {
                    continue;
                }
                if !tokens.is_empty() || !self.opts.ignore_empty_lines {
                    break;
                }
                continue;
            }

            if self.eol() {
                self.skip_rest_of_line();
                if self.opts.ignore_line_ends {
                    continue;
                }
                if tokens.is_empty() && self.opts.ignore_empty_lines {
                    continue;
                }
                break;
            }
        }

        if tokens.is_empty() && self.opts.ignore_empty_lines && self.eof() {
            return None;
        }
        Some(Line {
            data: self.map.as_deref().unwrap_or(&[]),
            line_number,
            tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn reader_for(content: &str, opts: ReaderOptions) -> (tempfile::NamedTempFile, Reader) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        let reader = Reader::open(file.path(), opts).unwrap();
        (file, reader)
    }

    fn line_strings(line: &Line) -> Vec<String> {
        (0..line.len()).map(|i| line.token_str(i).into_owned()).collect()
    }

    #[test]
    fn tokenizes_by_whitespace() {
        let (_f, mut r) = reader_for("foo  bar\tbaz\nsecond line\n", ReaderOptions::default());
        let line = r.read_line().unwrap();
        assert_eq!(line_strings(&line), vec!["foo", "bar", "baz"]);
        assert_eq!(line.line_number(), 1);
        drop(line);
        let line = r.read_line().unwrap();
        assert_eq!(line_strings(&line), vec!["second", "line"]);
        assert_eq!(line.line_number(), 2);
        drop(line);
        assert!(r.read_line().is_none());
    }

    #[test]
    fn token_positions() {
        let (_f, mut r) = reader_for("ab  cd\n", ReaderOptions::default());
        let line = r.read_line().unwrap();
        let tokens = line.tokens();
        assert_eq!(tokens[0], TokenRef { offset: 0, length: 2, line: 1, column: 1 });
        assert_eq!(tokens[1], TokenRef { offset: 4, length: 2, line: 1, column: 5 });
    }

    #[test]
    fn empty_lines_kept_by_default() {
        let (_f, mut r) = reader_for("a\n\nb\n", ReaderOptions::default());
        assert_eq!(line_strings(&r.read_line().unwrap()), vec!["a"]);
        assert!(r.read_line().unwrap().is_empty());
        assert_eq!(line_strings(&r.read_line().unwrap()), vec!["b"]);
    }

    #[test]
    fn empty_lines_skipped_when_requested() {
        let opts = ReaderOptions { ignore_empty_lines: true, ..Default::default() };
        let (_f, mut r) = reader_for("a\n\n\nb\n\n", opts);
        assert_eq!(line_strings(&r.read_line().unwrap()), vec!["a"]);
        let line = r.read_line().unwrap();
        assert_eq!(line_strings(&line), vec!["b"]);
        assert_eq!(line.line_number(), 4);
        drop(line);
        assert!(r.read_line().is_none());
    }

    #[test]
    fn comments_elided() {
        let opts = ReaderOptions {
            allow_comments: true,
            ignore_empty_lines: true,
            ..Default::default()
        };
        let (_f, mut r) = reader_for("# header\na b # trailing\nc\n", opts);
        assert_eq!(line_strings(&r.read_line().unwrap()), vec!["a", "b"]);
        assert_eq!(line_strings(&r.read_line().unwrap()), vec!["c"]);
        assert!(r.read_line().is_none());
    }

    #[test]
    fn ignore_line_ends_yields_one_virtual_line() {
        let opts = ReaderOptions { ignore_line_ends: true, ..Default::default() };
        let (_f, mut r) = reader_for("a b\nc\nd e\n", opts);
        let line = r.read_line().unwrap();
        assert_eq!(line_strings(&line), vec!["a", "b", "c", "d", "e"]);
        drop(line);
        assert!(r.read_line().is_none());
    }

    #[test]
    fn populate_touches_whole_file() {
        let (_f, r) = reader_for(&"x".repeat(10_000), ReaderOptions::default());
        r.populate();
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = Reader::open(Path::new("/nonexistent/grader-input"), ReaderOptions::default());
        assert!(matches!(err, Err(ReaderError::Io(_))));
    }
}
