//! Streaming recovery of JSON documents from legacy export files.
//!
//! Exports arrive in one of three shapes: a JSON array, JSON-Lines, or
//! objects concatenated with no separator at all. The reader first tries
//! line mode; while no line has parsed yet every line is also fed through
//! [`BraceScanner`], so if line mode never produces a document the scanner's
//! candidates are used instead without re-reading the input.
//!
//! Only a line that parses at scanner depth zero commits line mode. A line
//! that parses while the scanner has an object open (`{}` inside a
//! pretty-printed array, say) is held back and only used if the scanner
//! recovers nothing from the whole input.

use memchr::{memchr2, memchr3};
use serde_json::Value;
use std::collections::VecDeque;
use std::io::{self, BufRead};

/// Default probe window: bytes read in line mode before giving up on it.
pub const DEFAULT_PROBE_BYTES: usize = 1024 * 1024;

const SNIPPET_BYTES: usize = 160;

/// A chunk of input that could not be parsed. Soft error: counted and skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedChunk {
    /// Byte offset of the chunk in its source.
    pub offset: u64,
    /// Leading bytes of the chunk, lossily decoded, for manual recovery.
    pub snippet: String,
    pub error: String,
}

impl RejectedChunk {
    fn new(offset: u64, bytes: &[u8], error: impl Into<String>) -> Self {
        Self {
            offset,
            snippet: snippet(bytes),
            error: error.into(),
        }
    }
}

pub fn snippet(bytes: &[u8]) -> String {
    let end = bytes.len().min(SNIPPET_BYTES);
    String::from_utf8_lossy(&bytes[..end]).trim().to_string()
}

#[derive(Debug)]
pub enum ExportItem {
    Document(Value),
    Rejected(RejectedChunk),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStats {
    pub documents: u64,
    pub rejected: u64,
    pub bytes: u64,
}

// ---------- Brace scanner ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    /// Structural context: braces count, a quote opens a string.
    Outside,
    /// Inside a string literal: only `"` and `\` matter.
    InString,
    /// The byte right after a backslash inside a string; always literal.
    Escaped,
}

/// A complete top-level `{...}` span found by the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub offset: u64,
    pub bytes: Vec<u8>,
}

/// Byte-level scanner that splits concatenated JSON objects.
///
/// Tracks brace depth in the `Outside` state only, so braces and quotes
/// inside string literals (including escaped quotes) never move a boundary.
/// Input may be fed in arbitrary slices; state carries across calls.
#[derive(Debug)]
pub struct BraceScanner {
    state: ScanState,
    depth: u32,
    buf: Vec<u8>,
    start_offset: u64,
    consumed: u64,
}

impl Default for BraceScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl BraceScanner {
    pub fn new() -> Self {
        Self {
            state: ScanState::Outside,
            depth: 0,
            buf: Vec::new(),
            start_offset: 0,
            consumed: 0,
        }
    }

    /// Scan `bytes`, pushing each candidate that closes back to depth zero.
    pub fn feed(&mut self, bytes: &[u8], out: &mut VecDeque<Candidate>) {
        let mut i = 0usize;
        while i < bytes.len() {
            match self.state {
                ScanState::Outside => {
                    let Some(rel) = memchr3(b'{', b'}', b'"', &bytes[i..]) else {
                        self.keep(&bytes[i..]);
                        break;
                    };
                    let pos = i + rel;
                    self.keep(&bytes[i..pos]);
                    match bytes[pos] {
                        b'{' => {
                            if self.depth == 0 {
                                self.buf.clear();
                                self.start_offset = self.consumed + pos as u64;
                            }
                            self.depth += 1;
                            self.buf.push(b'{');
                        }
                        b'}' => {
                            // A closing brace at depth zero is stray noise between objects.
                            if self.depth > 0 {
                                self.buf.push(b'}');
                                self.depth -= 1;
                                if self.depth == 0 {
                                    out.push_back(Candidate {
                                        offset: self.start_offset,
                                        bytes: std::mem::take(&mut self.buf),
                                    });
                                }
                            }
                        }
                        _ => {
                            self.keep(&bytes[pos..=pos]);
                            self.state = ScanState::InString;
                        }
                    }
                    i = pos + 1;
                }
                ScanState::InString => {
                    let Some(rel) = memchr2(b'"', b'\\', &bytes[i..]) else {
                        self.keep(&bytes[i..]);
                        break;
                    };
                    let pos = i + rel;
                    self.keep(&bytes[i..=pos]);
                    self.state = if bytes[pos] == b'"' {
                        ScanState::Outside
                    } else {
                        ScanState::Escaped
                    };
                    i = pos + 1;
                }
                ScanState::Escaped => {
                    self.keep(&bytes[i..=i]);
                    self.state = ScanState::InString;
                    i += 1;
                }
            }
        }
        self.consumed += bytes.len() as u64;
    }

    /// Flush an unterminated candidate left open at end of input.
    pub fn finish(&mut self) -> Option<Candidate> {
        let open = self.depth > 0;
        self.depth = 0;
        self.state = ScanState::Outside;
        if open {
            Some(Candidate {
                offset: self.start_offset,
                bytes: std::mem::take(&mut self.buf),
            })
        } else {
            self.buf.clear();
            None
        }
    }

    /// Open-brace depth after everything fed so far.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    fn keep(&mut self, bytes: &[u8]) {
        if self.depth > 0 {
            self.buf.extend_from_slice(bytes);
        }
    }
}

// ---------- Line parsing ----------

enum LineOutcome {
    Blank,
    Documents(Vec<Value>),
    Failed(String),
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    if let Some(rest) = bytes.strip_prefix(b"\xEF\xBB\xBF".as_slice()) {
        bytes = rest;
    }
    while let [first, rest @ ..] = bytes {
        if first.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = bytes {
        if last.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}

fn parse_line(raw: &[u8]) -> LineOutcome {
    let mut line = trim_ascii(raw);
    if line.is_empty() || line == b"[" || line == b"]" || line == b"]," {
        return LineOutcome::Blank;
    }
    if let Some(rest) = line.strip_suffix(b",".as_slice()) {
        line = rest;
    }
    match serde_json::from_slice::<Value>(line) {
        Ok(Value::Array(items)) => LineOutcome::Documents(items),
        Ok(v @ Value::Object(_)) => LineOutcome::Documents(vec![v]),
        Ok(_) => LineOutcome::Failed("line is a JSON scalar, not a document".into()),
        Err(e) => LineOutcome::Failed(e.to_string()),
    }
}

// ---------- Reader ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Probing,
    Lines,
    Braces,
    Done,
}

/// Pull-based document reader over any `BufRead`.
///
/// Yields documents as they are recovered; never buffers the whole input
/// once a mode is committed. I/O errors are returned as `Err` and are fatal
/// for the source; unparseable chunks are yielded as [`ExportItem::Rejected`].
pub struct ExportReader<R> {
    reader: R,
    mode: Mode,
    scanner: BraceScanner,
    candidates: VecDeque<Candidate>,
    /// Line-mode reading of the probed lines, in input order.
    probe_lines: Vec<ExportItem>,
    /// Documents in `probe_lines` that parsed inside an open object.
    probe_nested: usize,
    ready: VecDeque<ExportItem>,
    line: Vec<u8>,
    offset: u64,
    probe_bytes: usize,
    stats: ReadStats,
}

impl<R: BufRead> ExportReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_probe_bytes(reader, DEFAULT_PROBE_BYTES)
    }

    pub fn with_probe_bytes(reader: R, probe_bytes: usize) -> Self {
        Self {
            reader,
            mode: Mode::Probing,
            scanner: BraceScanner::new(),
            candidates: VecDeque::new(),
            probe_lines: Vec::new(),
            probe_nested: 0,
            ready: VecDeque::new(),
            line: Vec::new(),
            offset: 0,
            probe_bytes: probe_bytes.max(1),
            stats: ReadStats::default(),
        }
    }

    pub fn stats(&self) -> ReadStats {
        self.stats
    }

    fn step(&mut self) -> io::Result<()> {
        match self.mode {
            Mode::Probing => self.step_probe(),
            Mode::Lines => self.step_lines(),
            Mode::Braces => self.step_braces(),
            Mode::Done => Ok(()),
        }
    }

    fn step_probe(&mut self) -> io::Result<()> {
        self.line.clear();
        let n = self.reader.read_until(b'\n', &mut self.line)?;
        if n == 0 {
            self.settle_probe_at_eof();
            return Ok(());
        }
        let start = self.offset;
        self.offset += n as u64;
        self.stats.bytes += n as u64;
        let depth_before = self.scanner.depth();
        self.scanner.feed(&self.line, &mut self.candidates);
        let top_level = depth_before == 0 && self.scanner.depth() == 0;

        match parse_line(&self.line) {
            LineOutcome::Blank => {}
            LineOutcome::Documents(docs) if docs.is_empty() => {}
            LineOutcome::Documents(docs) if top_level => {
                self.commit_lines();
                self.ready.extend(docs.into_iter().map(ExportItem::Document));
                return Ok(());
            }
            LineOutcome::Documents(docs) => {
                self.probe_nested += docs.len();
                self.probe_lines
                    .extend(docs.into_iter().map(ExportItem::Document));
            }
            LineOutcome::Failed(err) => {
                self.probe_lines.push(ExportItem::Rejected(RejectedChunk::new(
                    start, &self.line, err,
                )));
            }
        }

        if self.offset >= self.probe_bytes as u64 {
            self.probe_lines.clear();
            self.probe_nested = 0;
            self.mode = Mode::Braces;
            self.drain_candidates();
        }
        Ok(())
    }

    /// Switch to line mode, replaying the probed lines as line mode reads them.
    fn commit_lines(&mut self) {
        self.mode = Mode::Lines;
        self.candidates.clear();
        self.scanner = BraceScanner::new();
        self.probe_nested = 0;
        self.ready.extend(self.probe_lines.drain(..));
    }

    /// Whole input fit in the probe window without a top-level line parsing.
    /// The scanner's view wins unless it closed no object at all and some
    /// nested line did parse.
    fn settle_probe_at_eof(&mut self) {
        if self.candidates.is_empty() && self.probe_nested > 0 {
            self.commit_lines();
        } else {
            self.probe_lines.clear();
            self.probe_nested = 0;
            self.drain_candidates();
            self.finish_scanner();
        }
        self.mode = Mode::Done;
    }

    fn step_lines(&mut self) -> io::Result<()> {
        self.line.clear();
        let n = self.reader.read_until(b'\n', &mut self.line)?;
        if n == 0 {
            self.mode = Mode::Done;
            return Ok(());
        }
        let start = self.offset;
        self.offset += n as u64;
        self.stats.bytes += n as u64;
        match parse_line(&self.line) {
            LineOutcome::Blank => {}
            LineOutcome::Documents(docs) => {
                self.ready.extend(docs.into_iter().map(ExportItem::Document))
            }
            LineOutcome::Failed(err) => self
                .ready
                .push_back(ExportItem::Rejected(RejectedChunk::new(start, &self.line, err))),
        }
        Ok(())
    }

    fn step_braces(&mut self) -> io::Result<()> {
        let chunk = self.reader.fill_buf()?;
        if chunk.is_empty() {
            self.finish_scanner();
            self.mode = Mode::Done;
            return Ok(());
        }
        let len = chunk.len();
        self.scanner.feed(chunk, &mut self.candidates);
        self.reader.consume(len);
        self.offset += len as u64;
        self.stats.bytes += len as u64;
        self.drain_candidates();
        Ok(())
    }

    fn drain_candidates(&mut self) {
        while let Some(c) = self.candidates.pop_front() {
            let item = match serde_json::from_slice::<Value>(&c.bytes) {
                Ok(v) => ExportItem::Document(v),
                Err(e) => ExportItem::Rejected(RejectedChunk::new(c.offset, &c.bytes, e.to_string())),
            };
            self.ready.push_back(item);
        }
    }

    fn finish_scanner(&mut self) {
        if let Some(c) = self.scanner.finish() {
            self.ready.push_back(ExportItem::Rejected(RejectedChunk::new(
                c.offset,
                &c.bytes,
                "unterminated object at end of input",
            )));
        }
    }
}

impl<R: BufRead> Iterator for ExportReader<R> {
    type Item = io::Result<ExportItem>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.ready.pop_front() {
                match &item {
                    ExportItem::Document(_) => self.stats.documents += 1,
                    ExportItem::Rejected(_) => self.stats.rejected += 1,
                }
                return Some(Ok(item));
            }
            if self.mode == Mode::Done {
                return None;
            }
            if let Err(e) = self.step() {
                self.mode = Mode::Done;
                return Some(Err(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    fn read_all(input: &str) -> (Vec<Value>, Vec<RejectedChunk>) {
        read_all_with(input, DEFAULT_PROBE_BYTES)
    }

    fn read_all_with(input: &str, probe: usize) -> (Vec<Value>, Vec<RejectedChunk>) {
        let mut docs = Vec::new();
        let mut rejected = Vec::new();
        for item in ExportReader::with_probe_bytes(Cursor::new(input.as_bytes().to_vec()), probe) {
            match item.expect("in-memory read cannot fail") {
                ExportItem::Document(v) => docs.push(v),
                ExportItem::Rejected(r) => rejected.push(r),
            }
        }
        (docs, rejected)
    }

    #[test]
    fn json_lines_with_one_corrupt_line() {
        let input = "{\"a\":1}\n{\"a\":2}\n{\"a\": oops}\n\n{\"a\":3}\n";
        let (docs, rejected) = read_all(input);
        assert_eq!(docs, vec![json!({"a":1}), json!({"a":2}), json!({"a":3})]);
        assert_eq!(rejected.len(), 1);
        assert!(rejected[0].snippet.contains("oops"));
        assert_eq!(rejected[0].offset, 16);
    }

    #[test]
    fn corrupt_first_line_is_rejected_once_line_mode_commits() {
        let input = "{\"a\": \n{\"a\":2}\n";
        let (docs, rejected) = read_all(input);
        assert_eq!(docs, vec![json!({"a":2})]);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].offset, 0);
    }

    #[test]
    fn nested_empty_object_on_its_own_line_does_not_commit_line_mode() {
        let input = concat!(
            "{\n",
            "  \"path\": \"pages/X\",\n",
            "  \"data\": [\n",
            "    {}\n",
            "  ]\n",
            "}\n",
            "{\n",
            "  \"path\": \"users\",\n",
            "  \"data\": {\"email\": \"a@b.com\"}\n",
            "}\n",
        );
        let (docs, rejected) = read_all(input);
        assert!(rejected.is_empty(), "{rejected:?}");
        assert_eq!(
            docs,
            vec![
                json!({"path": "pages/X", "data": [{}]}),
                json!({"path": "users", "data": {"email": "a@b.com"}}),
            ]
        );
    }

    #[test]
    fn empty_array_line_is_not_a_document() {
        let input = "[]\n{\n\"a\": 1\n}\n";
        let (docs, rejected) = read_all(input);
        assert_eq!(docs, vec![json!({"a":1})]);
        assert!(rejected.is_empty());
    }

    #[test]
    fn compact_array_on_one_line_yields_elements() {
        let (docs, rejected) = read_all("[{\"a\":1},{\"a\":2}]");
        assert_eq!(docs, vec![json!({"a":1}), json!({"a":2})]);
        assert!(rejected.is_empty());
    }

    #[test]
    fn array_with_one_object_per_line() {
        let input = "[\n  {\"a\":1},\n  {\"a\":2},\n  {\"a\":3}\n]\n";
        let (docs, rejected) = read_all(input);
        assert_eq!(docs.len(), 3);
        assert!(rejected.is_empty());
    }

    #[test]
    fn pretty_printed_array_falls_back_to_scanner() {
        let input = "[\n  {\n    \"a\": 1,\n    \"b\": {\"c\": [1, 2]}\n  },\n  {\n    \"a\": 2\n  }\n]\n";
        let (docs, rejected) = read_all(input);
        assert_eq!(docs, vec![json!({"a":1,"b":{"c":[1,2]}}), json!({"a":2})]);
        assert!(rejected.is_empty());
    }

    #[test]
    fn concatenated_objects_with_braces_inside_strings() {
        let input = concat!(
            r#"{"path":"pages/X","data":{"content":"a { brace"}}"#,
            r#"{"path":"users","data":{"note":"closing } and \"quoted {\" text"}}"#,
            r#"{"path":"content/k","data":"backslash at end \\"}"#,
            r#"{"path":"books","data":{"name":"}}}{{{"}}"#,
        );
        let (docs, rejected) = read_all(input);
        assert_eq!(docs.len(), 4);
        assert!(rejected.is_empty());
        assert_eq!(docs[0]["data"]["content"], json!("a { brace"));
        assert_eq!(docs[1]["data"]["note"], json!("closing } and \"quoted {\" text"));
        assert_eq!(docs[2]["data"], json!("backslash at end \\"));
        assert_eq!(docs[3]["data"]["name"], json!("}}}{{{"));
    }

    #[test]
    fn one_bad_candidate_does_not_poison_neighbours() {
        let input = r#"{"a":1}{"a": nope}{"a":3}"#;
        let (docs, rejected) = read_all(input);
        assert_eq!(docs, vec![json!({"a":1}), json!({"a":3})]);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].offset, 7);
    }

    #[test]
    fn unterminated_tail_is_rejected() {
        let (docs, rejected) = read_all(r#"{"a":1}{"a":{"b":2}"#);
        assert_eq!(docs, vec![json!({"a":1})]);
        assert_eq!(rejected.len(), 1);
        assert!(rejected[0].error.contains("unterminated"));
    }

    #[test]
    fn small_probe_window_switches_to_scanner_and_streams() {
        let mut input = String::new();
        for i in 0..50 {
            input.push_str(&format!("{{\n\"i\": {i},\n\"s\": \"{{}}\"\n}}"));
        }
        let (docs, rejected) = read_all_with(&input, 32);
        assert_eq!(docs.len(), 50);
        assert!(rejected.is_empty());
        assert_eq!(docs[49]["i"], json!(49));
    }

    #[test]
    fn scanner_is_independent_of_feed_boundaries() {
        let input = br#"{"a":"x\"}{"}{"b":"\\"}{"c":{"d":"}"}}"#;
        let mut whole = VecDeque::new();
        BraceScanner::new().feed(input, &mut whole);

        let mut bytewise = VecDeque::new();
        let mut scanner = BraceScanner::new();
        for b in input.chunks(1) {
            scanner.feed(b, &mut bytewise);
        }
        assert_eq!(whole.len(), 3);
        assert_eq!(whole, bytewise);
        assert!(scanner.finish().is_none());
    }

    #[test]
    fn empty_input_yields_nothing() {
        let (docs, rejected) = read_all("\n\n   \n");
        assert!(docs.is_empty());
        assert!(rejected.is_empty());
    }

    #[test]
    fn stats_track_documents_and_rejections() {
        let mut reader = ExportReader::new(Cursor::new(b"{\"a\":1}\nbad\n".to_vec()));
        let items: Vec<_> = reader.by_ref().collect();
        assert_eq!(items.len(), 2);
        let stats = reader.stats();
        assert_eq!(stats.documents, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.bytes, 12);
    }
}
