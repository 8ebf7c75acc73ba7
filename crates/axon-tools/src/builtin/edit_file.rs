// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use axon_config::AgentMode;

use crate::policy::ApprovalPolicy;
use crate::tool::{Tool, ToolCall, ToolOutput};

/// Minimum per-line and mean similarity for the fuzzy strategy to accept a window.
const FUZZY_THRESHOLD: f64 = 0.80;

/// Sentinel marking an elided gap between anchors in a non-contiguous search.
const ELISION_MARKER: &str = "...";

/// Which strategy produced a [`MatchSite`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchLevel {
    Exact,
    Whitespace,
    Elided,
    Fuzzy,
}

/// A located edit site: the byte range in the original content that the
/// search matched, and the level of the strategy that found it.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchSite {
    pub level: MatchLevel,
    pub start: usize,
    pub end: usize,
    pub original: String,
}

// ── Line indexing ─────────────────────────────────────────────────────────────

/// Byte `(start, end)` of every line in `s`, newline excluded. A trailing
/// newline in `s` produces one final empty span.
fn line_spans(s: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    for (i, b) in s.bytes().enumerate() {
        if b == b'\n' {
            spans.push((start, i));
            start = i + 1;
        }
    }
    spans.push((start, s.len()));
    spans
}

/// Extend `end` by one byte if the file content has a newline there — used
/// to decide whether a matched line range should swallow its trailing `\n`.
fn include_trailing_newline(content: &str, end: usize) -> usize {
    if end < content.len() && content.as_bytes()[end] == b'\n' {
        end + 1
    } else {
        end
    }
}

// ── Strategy 1: exact ──────────────────────────────────────────────────────────

fn try_exact(content: &str, search: &str) -> Option<MatchSite> {
    if search.is_empty() {
        return None;
    }
    let start = content.find(search)?;
    let end = start + search.len();
    Some(MatchSite {
        level: MatchLevel::Exact,
        start,
        end,
        original: content[start..end].to_string(),
    })
}

// ── Strategy 2: whitespace-normalized ──────────────────────────────────────────

/// Split `search` into lines, honoring whether it ends with a trailing
/// newline (in which case the final, empty element is dropped and the match
/// must consume the file's own trailing newline to stay consistent).
fn search_lines_and_trailing_nl(search: &str) -> (Vec<&str>, bool) {
    let trailing_nl = search.ends_with('\n');
    let mut lines: Vec<&str> = search.split('\n').collect();
    if trailing_nl {
        lines.pop();
    }
    (lines, trailing_nl)
}

fn try_whitespace(content: &str, search: &str) -> Option<MatchSite> {
    let (search_lines, trailing_nl) = search_lines_and_trailing_nl(search);
    if search_lines.is_empty() {
        return None;
    }
    let search_trimmed: Vec<&str> = search_lines.iter().map(|l| l.trim()).collect();

    let spans = line_spans(content);
    let content_trimmed: Vec<&str> = spans.iter().map(|&(s, e)| content[s..e].trim()).collect();

    let n = search_trimmed.len();
    if content_trimmed.len() < n {
        return None;
    }
    for i in 0..=(content_trimmed.len() - n) {
        if content_trimmed[i..i + n] == search_trimmed[..] {
            let start = spans[i].0;
            let mut end = spans[i + n - 1].1;
            if trailing_nl {
                end = include_trailing_newline(content, end);
            }
            return Some(MatchSite {
                level: MatchLevel::Whitespace,
                start,
                end,
                original: content[start..end].to_string(),
            });
        }
    }
    None
}

// ── Strategy 3: non-contiguous with elision markers ───────────────────────────

/// Whitespace-normalized substring search within `haystack`, returning byte
/// offsets relative to `haystack`.
fn find_stripped(haystack: &str, needle: &str) -> Option<(usize, usize)> {
    let needle_lines: Vec<&str> = needle.split('\n').map(str::trim).collect();
    let spans = line_spans(haystack);
    let hay_trimmed: Vec<&str> = spans.iter().map(|&(s, e)| haystack[s..e].trim()).collect();
    let n = needle_lines.len();
    if hay_trimmed.len() < n {
        return None;
    }
    for i in 0..=(hay_trimmed.len() - n) {
        if hay_trimmed[i..i + n] == needle_lines[..] {
            return Some((spans[i].0, spans[i + n - 1].1));
        }
    }
    None
}

fn try_elided(content: &str, search: &str) -> Option<MatchSite> {
    if !search.contains(ELISION_MARKER) {
        return None;
    }
    let anchors: Vec<&str> = search
        .split(ELISION_MARKER)
        .map(|a| a.trim_matches('\n'))
        .filter(|a| !a.is_empty())
        .collect();
    if anchors.len() < 2 {
        return None;
    }

    let mut search_from = 0usize;
    let mut first_start: Option<usize> = None;
    let mut last_end: Option<usize> = None;

    for anchor in &anchors {
        let remaining = &content[search_from..];
        let found = remaining
            .find(anchor)
            .map(|p| (search_from + p, search_from + p + anchor.len()))
            .or_else(|| {
                find_stripped(remaining, anchor).map(|(s, e)| (search_from + s, search_from + e))
            });
        let (s, e) = found?;
        if first_start.is_none() {
            first_start = Some(s);
        }
        last_end = Some(e);
        search_from = e;
    }

    let start = first_start?;
    let end = last_end?;
    Some(MatchSite {
        level: MatchLevel::Elided,
        start,
        end,
        original: content[start..end].to_string(),
    })
}

// ── Strategy 4: fuzzy (per-line Levenshtein) ──────────────────────────────────

fn line_similarity(a: &str, b: &str) -> f64 {
    let a = a.trim();
    let b = b.trim();
    if a == b {
        return 1.0;
    }
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    let dist = strsim::levenshtein(a, b);
    1.0 - (dist as f64 / max_len as f64)
}

fn try_fuzzy(content: &str, search: &str) -> Option<MatchSite> {
    let (search_lines, trailing_nl) = search_lines_and_trailing_nl(search);
    if search_lines.is_empty() {
        return None;
    }
    let n = search_lines.len();

    let spans = line_spans(content);
    let content_lines: Vec<&str> = spans.iter().map(|&(s, e)| &content[s..e]).collect();
    if content_lines.len() < n {
        return None;
    }

    let mut best: Option<(usize, f64)> = None;
    for i in 0..=(content_lines.len() - n) {
        let mut sum = 0.0;
        let mut all_ok = true;
        for k in 0..n {
            let sim = line_similarity(content_lines[i + k], search_lines[k]);
            if sim < FUZZY_THRESHOLD {
                all_ok = false;
                break;
            }
            sum += sim;
        }
        if !all_ok {
            continue;
        }
        let mean = sum / n as f64;
        if mean < FUZZY_THRESHOLD {
            continue;
        }
        if best.as_ref().map(|&(_, m)| mean > m).unwrap_or(true) {
            best = Some((i, mean));
        }
    }

    best.map(|(i, _)| {
        let start = spans[i].0;
        let mut end = spans[i + n - 1].1;
        if trailing_nl {
            end = include_trailing_newline(content, end);
        }
        MatchSite {
            level: MatchLevel::Fuzzy,
            start,
            end,
            original: content[start..end].to_string(),
        }
    })
}

// ── Public entry points ────────────────────────────────────────────────────────

/// Locate `search` in `content`, trying the four strategies in order and
/// stopping at the first success.
pub fn find_edit_site(content: &str, search: &str) -> Result<MatchSite, String> {
    if search.is_empty() {
        return Err("search string is empty".to_string());
    }
    try_exact(content, search)
        .or_else(|| try_whitespace(content, search))
        .or_else(|| try_elided(content, search))
        .or_else(|| try_fuzzy(content, search))
        .ok_or_else(|| {
            "could not find the search text in the file (tried exact, whitespace-normalized, \
             elided-anchor, and fuzzy matching)"
                .to_string()
        })
}

/// Guarded variant: restrict the search to the 1-indexed inclusive line
/// range `[start_line, end_line]` before running the same pipeline, then
/// shift the result back to whole-file byte coordinates.
pub fn find_edit_site_in_range(
    content: &str,
    search: &str,
    start_line: usize,
    end_line: usize,
) -> Result<MatchSite, String> {
    let spans = line_spans(content);
    if start_line == 0 || start_line > end_line || end_line > spans.len() {
        return Err(format!(
            "line range {start_line}..={end_line} is out of bounds for a {}-line file",
            spans.len()
        ));
    }
    let range_start = spans[start_line - 1].0;
    let range_end = include_trailing_newline(content, spans[end_line - 1].1);
    let window = &content[range_start..range_end];

    let mut site = find_edit_site(window, search)?;
    site.start += range_start;
    site.end += range_start;
    Ok(site)
}

// ── Tool ────────────────────────────────────────────────────────────────────────

pub struct EditFileTool;

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Edit a file by replacing one located span of text with new content.\n\
         \n\
         `search` must match existing file content. It is located using four\n\
         strategies in order: an exact byte match; a whitespace-normalized line\n\
         match (indentation differences tolerated); a non-contiguous match where\n\
         `...` between two or more anchor blocks skips unchanged text in between;\n\
         and finally a fuzzy per-line match for near-identical text. The first\n\
         strategy that succeeds wins.\n\
         \n\
         Pass `start_line`/`end_line` (1-indexed, inclusive) to restrict the\n\
         search to a known region of the file — useful when the same text\n\
         appears more than once.\n\
         \n\
         Re-read the file after any previous edit before writing new `search` text."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or relative path to the file to edit"
                },
                "search": {
                    "type": "string",
                    "description": "Text to locate in the file. Use `...` between anchor \
                                    blocks to skip unchanged text in a large span."
                },
                "replace": {
                    "type": "string",
                    "description": "Text to substitute in place of the matched span"
                },
                "start_line": {
                    "type": "integer",
                    "description": "1-indexed inclusive start line restricting the search"
                },
                "end_line": {
                    "type": "integer",
                    "description": "1-indexed inclusive end line restricting the search"
                }
            },
            "required": ["path", "search", "replace"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }

    fn modes(&self) -> &[AgentMode] {
        &[AgentMode::Agent]
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let path = match call.args.get("path").and_then(|v| v.as_str()) {
            Some(s) => s.to_string(),
            None => return ToolOutput::err(&call.id, "Missing required parameter: path"),
        };
        let search = match call.args.get("search").and_then(|v| v.as_str()) {
            Some(s) => s.to_string(),
            None => return ToolOutput::err(&call.id, "Missing required parameter: search"),
        };
        let replace = match call.args.get("replace").and_then(|v| v.as_str()) {
            Some(s) => s.to_string(),
            None => return ToolOutput::err(&call.id, "Missing required parameter: replace"),
        };
        let start_line = call.args.get("start_line").and_then(|v| v.as_u64());
        let end_line = call.args.get("end_line").and_then(|v| v.as_u64());

        debug!(path = %path, guarded = start_line.is_some(), "edit_file tool");

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) => return ToolOutput::err(&call.id, format!("read error: {e}")),
        };

        let site = match (start_line, end_line) {
            (Some(s), Some(e)) => find_edit_site_in_range(&content, &search, s as usize, e as usize),
            (Some(_), None) | (None, Some(_)) => {
                return ToolOutput::err(&call.id, "start_line and end_line must be given together")
            }
            (None, None) => find_edit_site(&content, &search),
        };

        let site = match site {
            Ok(s) => s,
            Err(e) => return ToolOutput::err(&call.id, e),
        };

        let mut new_content = String::with_capacity(content.len() - site.original.len() + replace.len());
        new_content.push_str(&content[..site.start]);
        new_content.push_str(&replace);
        new_content.push_str(&content[site.end..]);

        if let Some(parent) = std::path::Path::new(&path).parent() {
            if !parent.as_os_str().is_empty() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
        }

        let tmp_path = format!("{path}.axon-tmp-{}", std::process::id());
        if let Err(e) = tokio::fs::write(&tmp_path, &new_content).await {
            return ToolOutput::err(&call.id, format!("write failed: {e}"));
        }
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return ToolOutput::err(&call.id, format!("rename failed: {e}"));
        }

        ToolOutput::ok(
            &call.id,
            format!("Edit applied ({:?} match at byte {}..{})", site.level, site.start, site.end),
        )
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
