//! Post-processing: deterministic cleanup of OCR-generated Markdown.
//!
//! ## Why is post-processing necessary?
//!
//! OCR services return Markdown that is *textually* right but often
//! *structurally* sloppy: `#Heading` without the space CommonMark requires,
//! bullets glued to their text (`-item`), headings jammed against paragraphs,
//! Windows line endings, invisible Unicode, and references to extracted images
//! that are never shipped with the text. Vision LLMs add their own habit of
//! wrapping the answer in a ```` ```markdown ```` fence.
//!
//! Each rule below is a pure `&str → String` pass. They run once per page,
//! before the page is checkpointed, so the assembled document is simply the
//! concatenation of already-clean pages.
//!
//! ## Rule Order
//!
//! Fences come off and line endings are normalised first so every later
//! rule sees plain `\n`-separated lines. Heading repair runs before heading
//! spacing so `#Title` is recognised as a heading. The final-newline pass is
//! last.

use once_cell::sync::Lazy;
use regex::Regex;

type Rule = fn(&str) -> String;

const RULES: &[Rule] = &[
    strip_markdown_fences,
    normalise_line_endings,
    trim_trailing_whitespace,
    remove_invisible_chars,
    fix_heading_markers,
    fix_list_markers,
    space_headings,
    collapse_blank_lines,
    fix_broken_tables,
    remove_mid_table_separators,
    unlink_unshipped_images,
    ensure_final_newline,
];

/// Apply every cleanup rule to one page of OCR output.
pub fn clean_markdown(input: &str) -> String {
    RULES
        .iter()
        .fold(input.to_string(), |text, rule| rule(&text))
}

// ── Fences & whitespace ──────────────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown|md)?\r?\n(.*?)\r?\n```\s*$").unwrap());

fn strip_markdown_fences(input: &str) -> String {
    match RE_OUTER_FENCES.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

fn trim_trailing_whitespace(input: &str) -> String {
    input.lines().map(str::trim_end).collect::<Vec<_>>().join("\n")
}

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        ['\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}'],
        "",
    )
}

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// At most one blank line between blocks.
fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").into_owned()
}

fn ensure_final_newline(input: &str) -> String {
    let trimmed = input.trim_end();
    if trimmed.is_empty() {
        String::from("\n")
    } else {
        format!("{}\n", trimmed)
    }
}

// ── Headings & lists ─────────────────────────────────────────────────────────

static RE_HEADING_NO_SPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(#{1,6})([^#\s])").unwrap());

/// `#Title` → `# Title`.
fn fix_heading_markers(input: &str) -> String {
    RE_HEADING_NO_SPACE.replace_all(input, "$1 $2").into_owned()
}

static RE_LIST_NO_SPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[*-]([^\s*\-|])").unwrap());

/// `-item` / `*item` → `* item`. Leaves `**bold**`, `---` and `-|` alone.
fn fix_list_markers(input: &str) -> String {
    RE_LIST_NO_SPACE.replace_all(input, "* $1").into_owned()
}

fn is_heading(line: &str) -> bool {
    let hashes = line.chars().take_while(|&c| c == '#').count();
    (1..=6).contains(&hashes) && line[hashes..].starts_with(' ')
}

/// A blank line before and after every heading.
fn space_headings(input: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut prev_heading = false;
    for line in input.lines() {
        let heading = is_heading(line);
        let need_gap = (heading || prev_heading) && !line.is_empty();
        if need_gap && out.last().is_some_and(|l| !l.is_empty()) {
            out.push("");
        }
        out.push(line);
        prev_heading = heading;
    }
    out.join("\n")
}

// ── Tables ───────────────────────────────────────────────────────────────────

fn is_table_row(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('|') && trimmed.ends_with('|') && trimmed.len() > 2
}

fn is_separator_row(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('|')
        && trimmed.contains('-')
        && trimmed.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

/// Insert the header separator a GFM table needs when it is missing.
fn fix_broken_tables(input: &str) -> String {
    let lines: Vec<&str> = input.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len() + 4);
    for (i, line) in lines.iter().enumerate() {
        out.push((*line).to_string());
        let starts_table = is_table_row(line)
            && !is_separator_row(line)
            && !lines[..i].last().is_some_and(|p| is_table_row(p));
        if !starts_table {
            continue;
        }
        let next = lines.get(i + 1).copied().unwrap_or("");
        if is_table_row(next) && !is_separator_row(next) {
            let cols = line.trim().matches('|').count().saturating_sub(1).max(1);
            out.push(format!("|{}", " --- |".repeat(cols)));
        }
    }
    out.join("\n")
}

/// Keep only the separator directly under the header row.
fn remove_mid_table_separators(input: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut row = 0usize;
    for line in input.lines() {
        if !is_table_row(line) {
            row = 0;
            out.push(line);
            continue;
        }
        row += 1;
        if is_separator_row(line) && row != 2 {
            continue;
        }
        out.push(line);
    }
    out.join("\n")
}

// ── Images ───────────────────────────────────────────────────────────────────

static RE_IMAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\(([^)]*)\)").unwrap());

/// Image references only survive when they point at an absolute http(s) URL.
///
/// OCR services emit `![img-0.jpeg](img-0.jpeg)` for figures they cropped
/// out; those files are not part of the output, so the link becomes its
/// italic alt text instead.
fn unlink_unshipped_images(input: &str) -> String {
    RE_IMAGE
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let alt = caps[1].trim();
            let url = caps[2].trim();
            let real = (url.starts_with("http://") || url.starts_with("https://"))
                && !["example.com", "placeholder.com", "placehold.it", "dummyimage.com"]
                    .iter()
                    .any(|d| url.contains(d));
            if real {
                caps[0].to_string()
            } else if alt.is_empty() {
                String::new()
            } else {
                format!("*{}*", alt)
            }
        })
        .into_owned()
}
