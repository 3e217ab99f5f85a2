//! CoNLL-U loading
//!
//! Reads CoNLL-U text, plain or gzipped, into a [`TokenStore`]. Lines are
//! handled as bytes and split on tabs with `memchr`; only the fields that
//! become values are checked as UTF-8.
//!
//! `# newdoc id = X` starts document `X` (the default document is `doc`),
//! sentences are numbered from 1 within their document, and multiword
//! ranges and empty nodes are skipped. HEAD `0` marks the root, DEPREL
//! becomes the relation, and FORM, LEMMA, UPOS, XPOS, FEATS and MISC
//! become attribute columns.
//!
//! CoNLL-U format: https://universaldependencies.org/format.html

use crate::store::{StoreError, TokenStore};
use atoi::FromRadix10Checked;
use bstr::ByteSlice;
use flate2::read::MultiGzDecoder;
use memchr::memchr_iter;
use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use thiserror::Error;

/// Document name used before any `# newdoc`
pub const DEFAULT_DOC: &str = "doc";

/// Attribute columns, in CoNLL-U field order
pub const COLUMNS: [&str; 6] = ["form", "lemma", "upos", "xpos", "feats", "misc"];

/// Error during CoNLL-U parsing
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Parse error at line {line_num}: {message}")]
pub struct ParseError {
    pub line_num: usize,
    pub message: String,
}

/// Error loading a CoNLL-U source into a store
#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One syntactic word
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub id: u32,
    pub head: Option<u32>,
    pub deprel: String,
    /// FORM, LEMMA, UPOS, XPOS, FEATS, MISC
    pub fields: [String; 6],
}

/// A parsed sentence with its position in the corpus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    pub doc: String,
    pub number: u32,
    pub text: Option<String>,
    pub tokens: Vec<Token>,
}

/// CoNLL-U reader that iterates over sentences
pub struct CoNLLUReader<R: BufRead> {
    reader: R,
    buf: Vec<u8>,
    line_num: usize,
    doc: String,
    counters: FxHashMap<String, u32>,
}

impl CoNLLUReader<Box<dyn BufRead + Send>> {
    /// Create a reader from a file path; `.gz` files are decompressed
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let reader: Box<dyn BufRead + Send> =
            if path.extension().is_some_and(|ext| ext == "gz") {
                Box::new(BufReader::new(MultiGzDecoder::new(file)))
            } else {
                Box::new(BufReader::new(file))
            };
        Ok(Self::new(reader))
    }
}

impl<'a> CoNLLUReader<&'a [u8]> {
    pub fn from_text(text: &'a str) -> Self {
        Self::new(text.as_bytes())
    }
}

impl<R: Read> CoNLLUReader<BufReader<MultiGzDecoder<R>>> {
    /// Read gzip-compressed CoNLL-U
    pub fn gzip(reader: R) -> Self {
        Self::new(BufReader::new(MultiGzDecoder::new(reader)))
    }
}

impl<R: BufRead> CoNLLUReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(256),
            line_num: 0,
            doc: DEFAULT_DOC.to_string(),
            counters: FxHashMap::default(),
        }
    }

    /// Read every sentence into a token store
    pub fn into_store(self) -> Result<TokenStore, LoadError> {
        let mut builder = TokenStore::builder();
        let mut sentences = 0;
        for sentence in self {
            let sentence = sentence?;
            sentences += 1;
            for token in &sentence.tokens {
                builder.push(
                    &sentence.doc,
                    sentence.number,
                    token.id,
                    token.head,
                    &token.deprel,
                    COLUMNS
                        .iter()
                        .zip(&token.fields)
                        .map(|(&column, value)| (column, value.as_str())),
                );
            }
        }
        tracing::debug!(sentences, tokens = builder.len(), "read CoNLL-U");
        Ok(builder.build()?)
    }

    fn error(&self, message: String) -> ParseError {
        ParseError {
            line_num: self.line_num,
            message,
        }
    }

    /// Handle a comment line; returns sentence text if present
    fn comment(&mut self, comment: &[u8]) -> Result<Option<String>, ParseError> {
        let Some((key, value)) = comment.split_once_str("=") else {
            // `# newdoc` without an id starts an anonymous document
            if comment.trim() == b"newdoc" {
                self.doc = DEFAULT_DOC.to_string();
            }
            return Ok(None);
        };
        let value = value
            .trim()
            .to_str()
            .map_err(|e| self.error(format!("Invalid UTF-8 in comment: {}", e)))?;
        match key.trim() {
            b"newdoc id" => self.doc = value.to_string(),
            b"text" => return Ok(Some(value.to_string())),
            _ => {}
        }
        Ok(None)
    }

    /// Parse a token line; returns `None` for ranges and empty nodes
    fn token(&self, line: &[u8]) -> Result<Option<Token>, ParseError> {
        let mut fields: [&[u8]; 10] = [b""; 10];
        let mut count = 0;
        let mut start = 0;
        for end in memchr_iter(b'\t', line).chain(std::iter::once(line.len())) {
            if count < fields.len() {
                fields[count] = &line[start..end];
            }
            count += 1;
            start = end + 1;
        }
        if count != fields.len() {
            return Err(self.error(format!("Expected 10 fields, found {}", count)));
        }

        // Multiword ranges (1-2) and empty nodes (2.1)
        if fields[0].contains(&b'-') || fields[0].contains(&b'.') {
            return Ok(None);
        }
        let id = parse_u32(fields[0])
            .ok_or_else(|| self.error(format!("Invalid ID: {}", fields[0].as_bstr())))?;
        let head = match fields[6] {
            b"0" | b"_" => None,
            head => Some(
                parse_u32(head)
                    .ok_or_else(|| self.error(format!("Invalid HEAD: {}", head.as_bstr())))?,
            ),
        };

        let text = |i: usize| -> Result<String, ParseError> {
            fields[i]
                .to_str()
                .map(str::to_string)
                .map_err(|e| self.error(format!("Invalid UTF-8 in field {}: {}", i + 1, e)))
        };
        Ok(Some(Token {
            id,
            head,
            deprel: text(7)?,
            fields: [text(1)?, text(2)?, text(3)?, text(4)?, text(5)?, text(9)?],
        }))
    }

    /// Read lines up to the next blank line after content
    ///
    /// Returns whether any non-blank line was read.
    fn read_block(
        &mut self,
        tokens: &mut Vec<Token>,
        text: &mut Option<String>,
    ) -> Result<bool, ParseError> {
        let mut seen_line = false;

        loop {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(self.error(format!("IO error: {}", e)));
                }
            }
            self.line_num += 1;

            let line = std::mem::take(&mut self.buf);
            let trimmed = line.trim_end_with(|c| c == '\n' || c == '\r');
            let result = if trimmed.trim().is_empty() {
                if seen_line {
                    self.buf = line;
                    break;
                }
                Ok(())
            } else if let Some(comment) = trimmed.strip_prefix(b"#") {
                seen_line = true;
                self.comment(comment).map(|t| {
                    if t.is_some() {
                        *text = t;
                    }
                })
            } else {
                seen_line = true;
                self.token(trimmed).map(|token| tokens.extend(token))
            };
            self.buf = line;
            result?;
        }

        Ok(seen_line)
    }

    fn next_sentence_number(&mut self) -> u32 {
        let counter = self.counters.entry(self.doc.clone()).or_insert(0);
        *counter += 1;
        *counter
    }
}

impl<R: BufRead> Iterator for CoNLLUReader<R> {
    type Item = Result<Sentence, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let mut tokens = Vec::new();
            let mut text = None;
            match self.read_block(&mut tokens, &mut text) {
                Ok(true) => {}
                Ok(false) => return None,
                Err(e) => return Some(Err(e)),
            }
            // Comment-only blocks (e.g. a lone `# newdoc`) are not sentences
            if tokens.is_empty() {
                continue;
            }
            let number = self.next_sentence_number();
            return Some(Ok(Sentence {
                doc: self.doc.clone(),
                number,
                text,
                tokens,
            }));
        }
    }
}

/// Load a CoNLL-U file (optionally `.gz`) into a token store
pub fn read_file(path: &Path) -> Result<TokenStore, LoadError> {
    CoNLLUReader::from_file(path)?.into_store()
}

/// Load CoNLL-U text into a token store
pub fn read_str(text: &str) -> Result<TokenStore, LoadError> {
    CoNLLUReader::from_text(text).into_store()
}

fn parse_u32(bytes: &[u8]) -> Option<u32> {
    match u32::from_radix_10_checked(bytes) {
        (Some(n), used) if used > 0 && used == bytes.len() => Some(n),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    const TWO_DOCS: &str = "# newdoc id = b
# text = The dog runs.
1\tThe\tthe\tDET\tDT\t_\t2\tdet\t_\t_
2\tdog\tdog\tNOUN\tNN\tNumber=Sing\t3\tnsubj\t_\t_
3\truns\trun\tVERB\tVBZ\t_\t0\troot\t_\tSpaceAfter=No
4\t.\t.\tPUNCT\t.\t_\t3\tpunct\t_\t_

1-2\tdon't\t_\t_\t_\t_\t_\t_\t_\t_
1\tdo\tdo\tAUX\t_\t_\t3\taux\t_\t_
2\tn't\tnot\tPART\t_\t_\t3\tadvmod\t_\t_
2.1\tgo\tgo\tVERB\t_\t_\t_\t_\t0:root\t_
3\tgo\tgo\tVERB\t_\t_\t0\troot\t_\t_

# newdoc id = a
1\tHi\thi\tINTJ\t_\t_\t0\troot\t_\t_
";

    #[test]
    fn test_parse_sentences() {
        let sentences: Vec<Sentence> = CoNLLUReader::from_text(TWO_DOCS)
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(sentences.len(), 3);
        assert_eq!(sentences[0].doc, "b");
        assert_eq!(sentences[0].number, 1);
        assert_eq!(sentences[0].text.as_deref(), Some("The dog runs."));
        assert_eq!(sentences[0].tokens.len(), 4);
        assert_eq!(sentences[0].tokens[2].head, None);
        assert_eq!(sentences[0].tokens[1].fields[4], "Number=Sing");

        // Range and empty node skipped
        assert_eq!(sentences[1].number, 2);
        let ids: Vec<u32> = sentences[1].tokens.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        assert_eq!(sentences[2].doc, "a");
        assert_eq!(sentences[2].number, 1);
    }

    #[test]
    fn test_read_into_store() {
        let store = read_str(TWO_DOCS).unwrap();

        assert_eq!(store.len(), 8);
        assert_eq!(store.docs(), &["a".to_string(), "b".to_string()]);
        let runs = store.global_id("b", 1, 3).unwrap();
        assert_eq!(store.get(runs, "relation"), Some("root"));
        assert_eq!(store.get(runs, "misc"), Some("SpaceAfter=No"));
        assert_eq!(store.get(runs, "feats"), Some("_"));

        let dog = store.position(store.global_id("b", 1, 2).unwrap()).unwrap();
        assert_eq!(store.parent(dog), store.position(runs));
    }

    #[test]
    fn test_default_document() {
        let text = "1\ta\ta\tX\t_\t_\t0\troot\t_\t_\n\n1\tb\tb\tX\t_\t_\t0\troot\t_\t_\n";
        let store = read_str(text).unwrap();
        assert_eq!(store.docs(), &[DEFAULT_DOC.to_string()]);
        assert_eq!(store.sentences().len(), 2);
        assert!(store.global_id(DEFAULT_DOC, 2, 1).is_some());
    }

    #[test]
    fn test_crlf_and_blank_runs() {
        let text = "\r\n\r\n1\ta\ta\tX\t_\t_\t0\troot\t_\t_\r\n\r\n\r\n";
        let sentences: Vec<Sentence> = CoNLLUReader::from_text(text)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(sentences.len(), 1);
        assert_eq!(sentences[0].tokens[0].deprel, "root");
        assert_eq!(sentences[0].tokens[0].fields[5], "_");
    }

    #[test]
    fn test_long_run_of_comment_only_blocks() {
        let mut text = String::new();
        for i in 0..100_000 {
            text.push_str(&format!("# newdoc id = d{}\n\n", i));
        }
        text.push_str("1\ta\ta\tX\t_\t_\t0\troot\t_\t_\n");

        let sentences: Vec<Sentence> = CoNLLUReader::from_text(&text)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(sentences.len(), 1);
        assert_eq!(sentences[0].doc, "d99999");
        assert_eq!(sentences[0].number, 1);
    }

    #[test]
    fn test_field_count_error() {
        let text = "1\ta\ta\tX\t_\t_\t0\troot\t_\t_\n2\tb\tb\n";
        let err = CoNLLUReader::from_text(text).next().unwrap().unwrap_err();
        assert_eq!(err.line_num, 2);
        assert_eq!(err.message, "Expected 10 fields, found 3");
    }

    #[test]
    fn test_invalid_numbers() {
        let text = "x\ta\ta\tX\t_\t_\t0\troot\t_\t_\n";
        let err = CoNLLUReader::from_text(text).next().unwrap().unwrap_err();
        assert_eq!(err.message, "Invalid ID: x");

        let text = "1\ta\ta\tX\t_\t_\t1a\troot\t_\t_\n";
        let err = CoNLLUReader::from_text(text).next().unwrap().unwrap_err();
        assert_eq!(err.message, "Invalid HEAD: 1a");
    }

    #[test]
    fn test_missing_head_is_store_error() {
        let text = "1\ta\ta\tX\t_\t_\t7\tdep\t_\t_\n";
        assert!(matches!(
            read_str(text),
            Err(LoadError::Store(StoreError::MissingParent { parent: 7, .. }))
        ));
    }

    #[test]
    fn test_gzip() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(TWO_DOCS.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();

        let store = CoNLLUReader::gzip(compressed.as_slice()).into_store().unwrap();
        assert_eq!(store.len(), 8);
    }

    #[test]
    fn test_parse_u32() {
        assert_eq!(parse_u32(b"42"), Some(42));
        assert_eq!(parse_u32(b""), None);
        assert_eq!(parse_u32(b"4 2"), None);
        assert_eq!(parse_u32(b"-1"), None);
        assert_eq!(parse_u32(b"99999999999"), None);
    }
}
