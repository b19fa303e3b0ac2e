//! Markdown rendering with citation links
//!
//! Answers are parsed with `pulldown-cmark` and flattened to terminal text.
//! Links whose target is a bare integer are citation references into the
//! message's citation list and never behave as hyperlinks.

use pulldown_cmark::{CodeBlockKind, Event, Options, Parser, Tag, TagEnd};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::ops::Range;

use crate::types::{Citation, CitationInfo};

const REASONING_LABEL: &str = "## 💭 Reasoning";
const REASONING_FENCE: &str = "think";

/// A citation marker as it appeared in the answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CitationMarker {
    /// Resolved to `citations[ordinal - 1]`
    Resolved(usize),
    /// Target did not resolve; shown as `[target]` and inert
    Inert(String),
}

/// Details shown when a resolved citation marker is inspected
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CitationPopover {
    pub ordinal: usize,
    /// `<knowledge base> / <file name>` once the source lookup has completed
    pub header: Option<String>,
    pub file_extension: Option<String>,
    pub text: String,
    pub metadata: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedAnswer {
    pub body: String,
    pub markers: Vec<CitationMarker>,
    /// Byte ranges of resolved markers within `body`, in order
    pub marker_spans: Vec<Range<usize>>,
    pub popovers: Vec<CitationPopover>,
}

impl RenderedAnswer {
    /// An empty answer is still loading
    pub fn is_placeholder(&self) -> bool {
        self.body.is_empty() && self.markers.is_empty()
    }
}

/// Turn reasoning-trace tags into a labelled code block so the rest of the
/// answer is parsed as ordinary markdown
pub fn preprocess(markdown: &str) -> String {
    markdown
        .replace("<think>", &format!("\n{}\n```{}\n", REASONING_LABEL, REASONING_FENCE))
        .replace("</think>", "\n```\n")
}

/// Parse a citation link target; only bare integers qualify
fn citation_target(dest: &str) -> bool {
    !dest.is_empty() && dest.bytes().all(|b| b.is_ascii_digit())
}

/// Resolve a citation target against the message's citations
pub fn resolve_citation<'a>(target: &str, citations: &'a [Citation]) -> Option<&'a Citation> {
    let ordinal: usize = target.parse().ok()?;
    if ordinal == 0 {
        return None;
    }
    citations.get(ordinal - 1)
}

/// Render decoded answer text.
///
/// `infos` holds whatever citation source lookups have completed so far,
/// keyed by [`Citation::info_key`]. Missing entries only drop the popover
/// header.
pub fn render_answer(
    markdown: &str,
    citations: &[Citation],
    infos: &HashMap<String, CitationInfo>,
) -> RenderedAnswer {
    let mut writer = TextWriter::default();
    let mut markers = Vec::new();
    let mut seen = BTreeSet::new();
    let mut popovers = Vec::new();

    if markdown.is_empty() {
        return RenderedAnswer {
            body: String::new(),
            markers,
            marker_spans: Vec::new(),
            popovers,
        };
    }

    let processed = preprocess(markdown);
    let options = Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH;
    let mut link: Option<LinkState> = None;

    for event in Parser::new_ext(&processed, options) {
        match event {
            Event::Start(Tag::Link { dest_url, .. }) => {
                if citation_target(&dest_url) {
                    let target = dest_url.to_string();
                    match resolve_citation(&target, citations) {
                        Some(citation) => {
                            writer.push_marker(&format!("[{}]", citation.id));
                            markers.push(CitationMarker::Resolved(citation.id));
                            if seen.insert(citation.id) {
                                popovers.push(popover_for(citation, infos));
                            }
                        }
                        None => {
                            writer.push(&format!("[{}]", target));
                            markers.push(CitationMarker::Inert(target));
                        }
                    }
                    link = Some(LinkState::Citation);
                } else {
                    link = Some(LinkState::Web {
                        url: dest_url.to_string(),
                        text: String::new(),
                    });
                }
            }
            Event::End(TagEnd::Link) => {
                if let Some(LinkState::Web { url, text }) = link.take() {
                    if !url.is_empty() && text != url {
                        writer.push(&format!(" ({})", url));
                    }
                }
            }
            Event::Text(text) | Event::Code(text) if link.is_some() => {
                if let Some(LinkState::Web { text: label, .. }) = link.as_mut() {
                    label.push_str(&text);
                    writer.push(&text);
                }
            }
            Event::Start(Tag::Heading { level, .. }) => {
                writer.push(&"#".repeat(level as usize));
                writer.push(" ");
            }
            Event::End(TagEnd::Heading(_)) => writer.end_block(),
            Event::End(TagEnd::Paragraph) => {
                if writer.lists.is_empty() {
                    writer.end_block();
                } else {
                    writer.end_line();
                }
            }
            Event::Start(Tag::CodeBlock(kind)) => {
                writer.in_code = true;
                if let CodeBlockKind::Fenced(lang) = kind {
                    if !lang.is_empty() && &*lang != REASONING_FENCE {
                        writer.push(&format!("    [{}]\n", lang));
                    }
                }
            }
            Event::End(TagEnd::CodeBlock) => {
                writer.in_code = false;
                writer.end_block();
            }
            Event::Start(Tag::List(start)) => {
                writer.end_line();
                writer.lists.push(start);
            }
            Event::End(TagEnd::List(_)) => {
                writer.lists.pop();
                if writer.lists.is_empty() {
                    writer.end_block();
                }
            }
            Event::Start(Tag::Item) => writer.start_item(),
            Event::End(TagEnd::Item) => writer.end_line(),
            Event::End(TagEnd::TableCell) => writer.push(" | "),
            Event::End(TagEnd::TableHead) | Event::End(TagEnd::TableRow) => writer.end_line(),
            Event::End(TagEnd::Table) => writer.end_block(),
            Event::Text(text) => writer.text(&text),
            Event::Code(code) => writer.push(&format!("`{}`", code)),
            Event::Html(html) | Event::InlineHtml(html) => writer.push(&html),
            Event::SoftBreak | Event::HardBreak => writer.push("\n"),
            Event::Rule => {
                writer.push("---");
                writer.end_block();
            }
            _ => {}
        }
    }

    let (body, marker_spans) = writer.finish();
    RenderedAnswer {
        body,
        markers,
        marker_spans,
        popovers,
    }
}

fn popover_for(citation: &Citation, infos: &HashMap<String, CitationInfo>) -> CitationPopover {
    let info = citation.info_key().and_then(|key| infos.get(&key));
    CitationPopover {
        ordinal: citation.id,
        header: info.map(CitationInfo::header),
        file_extension: info.map(|i| i.extension().to_string()),
        text: citation.text.clone(),
        metadata: citation.metadata_pairs(),
    }
}

enum LinkState {
    Citation,
    Web { url: String, text: String },
}

#[derive(Default)]
struct TextWriter {
    out: String,
    in_code: bool,
    lists: Vec<Option<u64>>,
    spans: Vec<Range<usize>>,
}

impl TextWriter {
    fn push(&mut self, s: &str) {
        self.out.push_str(s);
    }

    fn push_marker(&mut self, marker: &str) {
        let start = self.out.len();
        self.out.push_str(marker);
        self.spans.push(start..self.out.len());
    }

    fn text(&mut self, s: &str) {
        if self.in_code {
            for line in s.split_inclusive('\n') {
                self.out.push_str("    ");
                self.out.push_str(line);
            }
        } else {
            self.out.push_str(s);
        }
    }

    fn end_line(&mut self) {
        if !self.out.is_empty() && !self.out.ends_with('\n') {
            self.out.push('\n');
        }
    }

    fn end_block(&mut self) {
        self.end_line();
        if !self.out.is_empty() && !self.out.ends_with("\n\n") {
            self.out.push('\n');
        }
    }

    fn start_item(&mut self) {
        self.end_line();
        let depth = self.lists.len().saturating_sub(1);
        self.out.push_str(&"  ".repeat(depth));
        match self.lists.last_mut() {
            Some(Some(n)) => {
                self.out.push_str(&format!("{}. ", n));
                *n += 1;
            }
            _ => self.out.push_str("- "),
        }
    }

    /// Collapse runs of blank lines; marker spans move with the text
    fn finish(self) -> (String, Vec<Range<usize>>) {
        let skipped = self.out.len() - self.out.trim_start_matches('\n').len();
        let mut body = String::with_capacity(self.out.len());
        let mut spans = Vec::with_capacity(self.spans.len());
        let mut pending = self.spans.iter().peekable();
        let mut newlines = 0;
        for (index, c) in self.out[skipped..].char_indices() {
            while let Some(span) = pending.next_if(|span| span.start == skipped + index) {
                spans.push(body.len()..body.len() + (span.end - span.start));
            }
            if c == '\n' {
                newlines += 1;
                if newlines > 2 {
                    continue;
                }
            } else {
                newlines = 0;
            }
            body.push(c);
        }
        body.truncate(body.trim_end().len());
        (body, spans)
    }
}
