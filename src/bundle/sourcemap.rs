//! Source Map v3 output for the bundle.
//!
//! Only line granularity is recorded: each generated line that comes from a
//! source module maps to column zero of the matching source line. That is
//! enough for browser devtools to show the original file in stack traces.

use serde::{Deserialize, Serialize};

const BASE64: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Appends the Base64-VLQ encoding of `value` to `out`.
pub fn encode_vlq(value: i64, out: &mut String) {
    let mut vlq = if value < 0 {
        ((-value) << 1) | 1
    } else {
        value << 1
    };

    loop {
        let mut digit = (vlq & 0b11111) as usize;
        vlq >>= 5;
        if vlq > 0 {
            digit |= 0b100000;
        }
        out.push(BASE64[digit] as char);
        if vlq == 0 {
            break;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMap {
    pub version: u8,
    pub file: String,
    pub sources: Vec<String>,
    pub sources_content: Vec<String>,
    pub names: Vec<String>,
    pub mappings: String,
}

impl SourceMap {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Builds a [`SourceMap`] one generated line at a time.
#[derive(Debug, Default)]
pub struct SourceMapBuilder {
    file: String,
    sources: Vec<String>,
    contents: Vec<String>,
    mappings: String,
    lines: usize,
    // previous segment, the fields the format encodes relative to it
    prev_source: i64,
    prev_line: i64,
}

impl SourceMapBuilder {
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            ..Self::default()
        }
    }

    /// Registers a source file and returns its index.
    pub fn add_source(&mut self, path: impl Into<String>, content: impl Into<String>) -> u32 {
        self.sources.push(path.into());
        self.contents.push(content.into());
        (self.sources.len() - 1) as u32
    }

    /// Skips `count` generated lines that have no original location.
    pub fn skip_lines(&mut self, count: usize) {
        for _ in 0..count {
            self.next_line();
        }
    }

    /// Maps the next generated line to `line` (zero based) of `source`.
    pub fn map_line(&mut self, source: u32, line: u32) {
        self.next_line();

        let source = source as i64;
        let line = line as i64;

        encode_vlq(0, &mut self.mappings);
        encode_vlq(source - self.prev_source, &mut self.mappings);
        encode_vlq(line - self.prev_line, &mut self.mappings);
        encode_vlq(0, &mut self.mappings);

        self.prev_source = source;
        self.prev_line = line;
    }

    fn next_line(&mut self) {
        if self.lines > 0 {
            self.mappings.push(';');
        }
        self.lines += 1;
    }

    pub fn build(self) -> SourceMap {
        SourceMap {
            version: 3,
            file: self.file,
            sources: self.sources,
            sources_content: self.contents,
            names: vec![],
            mappings: self.mappings,
        }
    }
}
