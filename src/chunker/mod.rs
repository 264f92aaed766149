//! Heading-aware document chunking.
//!
//! Splits raw extracted text into heading-bounded, size-bounded chunks with
//! cross-chunk overlap, preserving the ancestor heading path for each chunk.
//! This is a pure, synchronous, single-pass computation: no I/O, fully
//! deterministic, safe to run in parallel across documents.
//!
//! Sizes are measured in characters, not bytes. The `max_chunk_size` bound
//! is enforced when chunks are flushed; the overlap prefix is prepended
//! afterwards, so a chunk's final content can reach
//! `max_chunk_size + overlap_size` characters. A single paragraph that
//! cannot be split further may exceed the bound on its own.

use serde::{Deserialize, Serialize};

use crate::types::KbError;

/// Tuning knobs for [`chunk`]. All sizes are character counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkOptions {
    /// Upper bound on chunk content at flush time.
    pub max_chunk_size: usize,
    /// Sections smaller than this are merged into the previous chunk.
    pub min_chunk_size: usize,
    /// Trailing characters of the previous chunk prepended to the next one.
    pub overlap_size: usize,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            max_chunk_size: 2000,
            min_chunk_size: 200,
            overlap_size: 200,
        }
    }
}

impl ChunkOptions {
    fn validate(&self) -> Result<(), KbError> {
        if self.max_chunk_size == 0 {
            return Err(KbError::InvalidInput(
                "max_chunk_size must be positive".into(),
            ));
        }
        if self.min_chunk_size > self.max_chunk_size {
            return Err(KbError::InvalidInput(format!(
                "min_chunk_size {} exceeds max_chunk_size {}",
                self.min_chunk_size, self.max_chunk_size
            )));
        }
        if self.overlap_size >= self.max_chunk_size {
            return Err(KbError::InvalidInput(format!(
                "overlap_size {} must be smaller than max_chunk_size {}",
                self.overlap_size, self.max_chunk_size
            )));
        }
        Ok(())
    }
}

/// A bounded, heading-scoped slice of a source document.
///
/// `chunk_index` values are contiguous and zero-based within a document.
/// `section_path` is the ordered chain of ancestor heading titles, including
/// the chunk's own heading, captured when its section was opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub content: String,
    pub heading: Option<String>,
    /// 1-6 for Markdown heading levels, 0 when the chunk has no heading.
    pub heading_level: u8,
    pub chunk_index: usize,
    pub section_path: Vec<String>,
}

#[derive(Debug)]
struct Section {
    heading: Option<String>,
    level: u8,
    body: String,
    path: Vec<String>,
}

#[derive(Debug)]
struct RawChunk {
    content: String,
    heading: Option<String>,
    level: u8,
    path: Vec<String>,
}

/// Splits `text` into an ordered chunk sequence.
///
/// Empty or whitespace-only input is rejected as an input error. Every
/// non-whitespace piece of the body ends up in some chunk's content; no
/// text is silently dropped. Re-running on identical input yields a
/// byte-identical sequence.
pub fn chunk(text: &str, options: &ChunkOptions) -> Result<Vec<DocumentChunk>, KbError> {
    options.validate()?;
    if text.trim().is_empty() {
        return Err(KbError::InvalidInput("document text is empty".into()));
    }

    let mut sections = split_sections(text);
    merge_small_headingless(&mut sections, options.min_chunk_size);

    let mut raw: Vec<RawChunk> = Vec::new();
    for section in &sections {
        emit_section(section, options, &mut raw);
    }

    apply_overlap(&mut raw, options.overlap_size);

    Ok(raw
        .into_iter()
        .enumerate()
        .map(|(chunk_index, r)| DocumentChunk {
            content: r.content,
            heading: r.heading,
            heading_level: r.level,
            chunk_index,
            section_path: r.path,
        })
        .collect())
}

/// Scans lines for Markdown-style headings, opening a new section per
/// heading and maintaining the strict ancestor chain of heading titles.
fn split_sections(text: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut stack: Vec<(String, u8)> = Vec::new();
    let mut current = Section {
        heading: None,
        level: 0,
        body: String::new(),
        path: Vec::new(),
    };

    for line in text.lines() {
        if let Some((level, title)) = parse_heading(line) {
            if current.heading.is_some() || !current.body.trim().is_empty() {
                sections.push(current);
            }
            // Pop entries at or below the new level so the stack holds the
            // strict ancestor chain.
            while stack.last().is_some_and(|(_, l)| *l >= level) {
                stack.pop();
            }
            stack.push((title.to_string(), level));
            current = Section {
                heading: Some(title.to_string()),
                level,
                body: String::new(),
                path: stack.iter().map(|(t, _)| t.clone()).collect(),
            };
        } else {
            if !current.body.is_empty() {
                current.body.push('\n');
            }
            current.body.push_str(line);
        }
    }

    if current.heading.is_some() || !current.body.trim().is_empty() {
        sections.push(current);
    }
    sections
}

fn parse_heading(line: &str) -> Option<(u8, &str)> {
    let hashes = line.bytes().take_while(|b| *b == b'#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let title = line[hashes..].strip_prefix(' ')?.trim();
    if title.is_empty() {
        return None;
    }
    Some((hashes as u8, title))
}

/// A headingless section below the minimum merges into the body of the
/// immediately preceding section. The very first section has no
/// predecessor and stands alone regardless of size.
fn merge_small_headingless(sections: &mut Vec<Section>, min_chunk_size: usize) {
    let mut index = 1;
    while index < sections.len() {
        let small = sections[index].heading.is_none()
            && char_len(sections[index].body.trim()) < min_chunk_size;
        if small {
            let body = sections.remove(index).body;
            let prev = &mut sections[index - 1].body;
            if !prev.is_empty() {
                prev.push('\n');
            }
            prev.push_str(&body);
        } else {
            index += 1;
        }
    }
}

fn emit_section(section: &Section, options: &ChunkOptions, out: &mut Vec<RawChunk>) {
    let body = section.body.trim();
    let full = match (&section.heading, body.is_empty()) {
        (Some(h), true) => h.clone(),
        (Some(h), false) => format!("{h}\n{body}"),
        (None, _) => body.to_string(),
    };
    if full.is_empty() {
        return;
    }

    if char_len(&full) <= options.max_chunk_size {
        if char_len(&full) < options.min_chunk_size && !out.is_empty() {
            // Small section: concatenate into the previous chunk instead of
            // emitting a standalone chunk below the minimum.
            let prev = out.last_mut().expect("out is non-empty");
            prev.content.push_str("\n\n");
            prev.content.push_str(&full);
        } else {
            out.push(raw_chunk(full, section));
        }
        return;
    }

    // Oversized section: greedily pack paragraphs, re-prefixing every piece
    // with the heading so each stays self-describing. The paragraph budget
    // leaves room for the prefix and its separator.
    let prefix = section.heading.clone();
    let prefix_overhead = prefix.as_deref().map_or(0, |p| char_len(p) + 1);
    let para_budget = options
        .max_chunk_size
        .saturating_sub(prefix_overhead)
        .max(1);
    let paragraphs = split_paragraphs(body, para_budget);
    let mut buffer = prefix.clone().unwrap_or_default();
    let mut bare = true;

    for para in paragraphs {
        if !bare {
            let candidate = char_len(&buffer) + 2 + char_len(&para);
            if candidate > options.max_chunk_size {
                out.push(raw_chunk(std::mem::take(&mut buffer), section));
                buffer = prefix.clone().unwrap_or_default();
                bare = true;
            }
        }
        if buffer.is_empty() {
            buffer = para;
        } else {
            buffer.push_str(if bare { "\n" } else { "\n\n" });
            buffer.push_str(&para);
        }
        bare = false;
    }
    if !buffer.is_empty() {
        out.push(raw_chunk(buffer, section));
    }
}

fn raw_chunk(content: String, section: &Section) -> RawChunk {
    RawChunk {
        content,
        heading: section.heading.clone(),
        level: section.level,
        path: section.path.clone(),
    }
}

/// Splits a section body into paragraph units: blank-line-separated blocks
/// first, falling back to grouping single-newline lines into buffers close
/// to (but not exceeding) `max` when the body is one contiguous block.
fn split_paragraphs(body: &str, max: usize) -> Vec<String> {
    let blocks: Vec<String> = body
        .split("\n\n")
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .map(String::from)
        .collect();
    if blocks.len() > 1 {
        return blocks;
    }

    let mut out = Vec::new();
    let mut buf = String::new();
    for line in body.lines() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            continue;
        }
        if !buf.is_empty() && char_len(&buf) + 1 + char_len(line) > max {
            out.push(std::mem::take(&mut buf));
        }
        if !buf.is_empty() {
            buf.push('\n');
        }
        buf.push_str(line);
    }
    if !buf.is_empty() {
        out.push(buf);
    }
    out
}

/// Prepends the trailing `overlap` characters of each chunk to its
/// successor, unless the successor already starts with that exact text
/// (avoids duplicate overlap when paragraphs were naturally contiguous).
fn apply_overlap(chunks: &mut [RawChunk], overlap: usize) {
    if overlap == 0 {
        return;
    }
    for i in 1..chunks.len() {
        let tail = char_tail(&chunks[i - 1].content, overlap).to_string();
        if tail.is_empty() || chunks[i].content.starts_with(&tail) {
            continue;
        }
        let mut content = tail;
        content.push_str(&chunks[i].content);
        chunks[i].content = content;
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Last `n` characters of `s`, char-boundary safe.
fn char_tail(s: &str, n: usize) -> &str {
    let total = char_len(s);
    if total <= n {
        return s;
    }
    let (idx, _) = s
        .char_indices()
        .nth(total - n)
        .expect("index within char count");
    &s[idx..]
}
