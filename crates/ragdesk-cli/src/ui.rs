//! Terminal output for answers, uploads and retrieval results

use colored::*;
use crossterm::cursor::{MoveToColumn, MoveToPreviousLine};
use crossterm::terminal::{Clear, ClearType, size};
use crossterm::execute;
use crossterm::tty::IsTty;
use std::fmt::Write as _;
use std::io::{self, BufRead, Write};
use std::sync::{Mutex, PoisonError};

use ragdesk_core::{
    Chat, CitationPopover, DocumentRecord, Error, FileStatus, Message, PreviewResponse,
    RenderedAnswer, Result, RetrievalHit, Role, UploadStatus,
};

const MAX_WIDTH: usize = 72;

fn divider_width() -> usize {
    let terminal_width = size().map(|(w, _)| w as usize).unwrap_or(80);
    std::cmp::min(MAX_WIDTH, terminal_width.saturating_sub(4)).max(20)
}

fn divider(width: usize) -> String {
    "─".repeat(width)
}

/// Display the conversation banner
pub fn display_chat_banner(title: &str, chat_id: i64) {
    let width = divider_width();
    let inner = width.saturating_sub(2);
    let heading = format!("💬 {} (chat {})", title, chat_id);
    let padding = inner.saturating_sub(heading.chars().count() + 3);

    println!();
    println!("{}", format!("┌{}┐", "─".repeat(inner)).blue());
    println!("│  {}{}│", heading.blue().bold(), " ".repeat(padding));
    println!("{}", format!("└{}┘", "─".repeat(inner)).blue());
    println!(
        "{}",
        "💡 Tip: Ask a question, or type 'exit' to leave".dimmed()
    );
    println!();
}

/// Format a rendered answer: the body with citation markers highlighted,
/// followed by the details of every cited passage
pub fn format_answer(rendered: &RenderedAnswer, width: usize) -> String {
    if rendered.is_placeholder() {
        return format!("{}\n", "…".dimmed());
    }

    let mut body = String::with_capacity(rendered.body.len());
    let mut last = 0;
    for span in &rendered.marker_spans {
        let (Some(before), Some(marker)) = (
            rendered.body.get(last..span.start),
            rendered.body.get(span.clone()),
        ) else {
            continue;
        };
        body.push_str(before);
        body.push_str(&marker.cyan().bold().to_string());
        last = span.end;
    }
    body.push_str(rendered.body.get(last..).unwrap_or_default());

    let mut out = String::new();
    let _ = writeln!(out, "{}", body.trim_end());
    out.push_str(&format_citations(rendered, width));
    out
}

/// Format the details of every cited passage
pub fn format_citations(rendered: &RenderedAnswer, width: usize) -> String {
    let mut out = String::new();
    for popover in &rendered.popovers {
        out.push('\n');
        out.push_str(&format_popover(popover, width));
    }
    out
}

fn format_popover(popover: &CitationPopover, width: usize) -> String {
    let mut out = String::new();
    let label = format!("[{}]", popover.ordinal).cyan().bold();

    match (&popover.header, &popover.file_extension) {
        (Some(header), Some(ext)) if !ext.is_empty() => {
            let _ = writeln!(out, "{} {} {}", label, header.bold(), format!("({})", ext).dimmed());
        }
        (Some(header), _) => {
            let _ = writeln!(out, "{} {}", label, header.bold());
        }
        (None, _) => {
            let _ = writeln!(out, "{}", label);
        }
    }

    let _ = writeln!(out, "{}", divider(width).dimmed());
    let _ = writeln!(out, "{}", popover.text.trim());
    let _ = writeln!(out, "{}", divider(width).dimmed());
    let _ = writeln!(out, "{}", "Debug Info".dimmed().bold());
    for (key, value) in &popover.metadata {
        let _ = writeln!(out, "  {}: {}", key.dimmed(), value);
    }
    out
}

/// Print a message; assistant answers are shown rendered
pub fn print_message(message: &Message, rendered: &RenderedAnswer) {
    match message.role {
        Role::User => {
            println!("{} {}", "you>".green().bold(), message.raw_content);
        }
        Role::Assistant => {
            println!("{}", "assistant>".blue().bold());
            print!("{}", format_answer(rendered, divider_width()));
        }
    }
    println!();
}

fn status_label(status: UploadStatus) -> ColoredString {
    let label = format!("{:<10}", status.to_string());
    match status {
        UploadStatus::Completed => label.green(),
        UploadStatus::Error => label.red(),
        UploadStatus::Processing | UploadStatus::Uploading => label.yellow(),
        UploadStatus::Pending | UploadStatus::Uploaded => label.normal(),
    }
}

/// Format the per-file status table
pub fn format_file_table(files: &[FileStatus]) -> String {
    let name_width = files
        .iter()
        .map(|f| f.file_name.chars().count())
        .max()
        .unwrap_or(0)
        .max(4);

    let mut out = String::new();
    for file in files {
        let detail = match (&file.error, &file.message, file.task_id) {
            (Some(error), _, _) => error.red().to_string(),
            (None, Some(message), _) => message.dimmed().to_string(),
            (None, None, Some(task_id)) => format!("task {}", task_id).dimmed().to_string(),
            (None, None, None) => String::new(),
        };
        let line = format!(
            "{} {:<width$}  {} {}",
            file.status.icon(),
            file.file_name,
            status_label(file.status),
            detail,
            width = name_width
        );
        let _ = writeln!(out, "{}", line.trim_end());
    }
    out
}

pub fn print_file_table(files: &[FileStatus]) {
    print!("{}", format_file_table(files));
}

/// Format a chunking preview
pub fn format_preview(file_name: &str, preview: &PreviewResponse, width: usize) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} {} ({} chunks)",
        "🔍 Preview of".bold(),
        file_name.bold(),
        preview.total_chunks
    );
    for (index, chunk) in preview.chunks.iter().enumerate() {
        let _ = writeln!(out, "{}", format!("── Chunk {} ", index + 1).dimmed());
        let _ = writeln!(out, "{}", chunk.content.trim());
    }
    let _ = writeln!(out, "{}", divider(width).dimmed());
    out
}

pub fn print_preview(file_name: &str, preview: &PreviewResponse) {
    print!("{}", format_preview(file_name, preview, divider_width()));
}

/// Format test-retrieval hits with their relevance as a percentage
pub fn format_retrieval_hits(hits: &[RetrievalHit]) -> String {
    if hits.is_empty() {
        return format!("{}\n", "No matching passages".dimmed());
    }

    let mut out = String::new();
    for (index, hit) in hits.iter().enumerate() {
        let score = format!("{:.1}%", hit.score * 100.0);
        let _ = writeln!(
            out,
            "{} {} {}",
            format!("#{}", index + 1).bold(),
            score.green(),
            hit.source().unwrap_or("unknown source").dimmed()
        );
        for line in hit.content.trim().lines() {
            let _ = writeln!(out, "    {}", line);
        }
    }
    out
}

pub fn print_retrieval_hits(hits: &[RetrievalHit]) {
    print!("{}", format_retrieval_hits(hits));
}

/// Print the chat prompt and read one line; `None` at end of input
pub fn read_prompt() -> Result<Option<String>> {
    print!("{} ", "you>".green().bold());
    io::stdout().flush()?;

    let mut input = String::new();
    if io::stdin().lock().read_line(&mut input)? == 0 {
        return Ok(None);
    }
    Ok(Some(input.trim().to_string()))
}

/// Terminal rows taken by `text` when printed from column 0 at `columns`
/// wide; the row holding the cursor counts
pub fn rows_used(text: &str, columns: usize) -> usize {
    let columns = columns.max(1);
    text.split('\n')
        .map(|line| line.chars().count().div_ceil(columns).max(1))
        .sum()
}

/// Streams answer text while it arrives, then swaps it for the rendered
/// answer.
///
/// Off a terminal nothing is streamed and only the rendered answer is
/// printed.
pub struct LiveAnswer {
    streamed: Mutex<String>,
    interactive: bool,
}

impl LiveAnswer {
    pub fn new() -> Self {
        Self {
            streamed: Mutex::new(String::new()),
            interactive: io::stdout().is_tty(),
        }
    }

    pub fn push(&self, delta: &str) {
        if !self.interactive {
            return;
        }
        self.streamed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_str(delta);
        print!("{}", delta.dimmed());
        let _ = io::stdout().flush();
    }

    /// Replace the streamed text with the rendered answer
    pub fn finish(self, rendered: &RenderedAnswer) -> Result<()> {
        let streamed = self
            .streamed
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        let mut stdout = io::stdout();

        if !streamed.is_empty() {
            let (columns, rows) = size()
                .map(|(w, h)| (w as usize, h as usize))
                .unwrap_or((80, 24));
            let used = rows_used(&streamed, columns);
            if used < rows {
                if used > 1 {
                    execute!(stdout, MoveToPreviousLine((used - 1) as u16))?;
                }
                execute!(stdout, MoveToColumn(0), Clear(ClearType::FromCursorDown))?;
            } else {
                writeln!(stdout)?;
                writeln!(stdout, "{}", divider(divider_width()).dimmed())?;
            }
        }

        write!(stdout, "{}", format_answer(rendered, divider_width()))?;
        stdout.flush()?;
        Ok(())
    }
}

impl Default for LiveAnswer {
    fn default() -> Self {
        Self::new()
    }
}

/// One-line error report carrying the status code
pub fn format_error(error: &Error) -> String {
    format!("{} {}", format!("[{}]", error.status()).red().bold(), error)
}

pub fn print_error(error: &Error) {
    println!("{} {}", "❌".red(), format_error(error));
}

/// Format the conversation list
pub fn format_chat_list(chats: &[Chat]) -> String {
    if chats.is_empty() {
        return format!("{}\n", "No conversations yet".dimmed());
    }

    let mut out = String::new();
    for chat in chats {
        let mut line = format!("{} {}", format!("#{:<4}", chat.id).bold(), chat.title);
        if !chat.knowledge_base_ids.is_empty() {
            let kbs: Vec<String> = chat.knowledge_base_ids.iter().map(|id| id.to_string()).collect();
            line.push_str(&format!("  kb {}", kbs.join(",")).dimmed().to_string());
        }
        if let Some(updated) = chat.updated_at {
            line.push_str(&format!("  {}", updated.format("%Y-%m-%d %H:%M")).dimmed().to_string());
        }
        let _ = writeln!(out, "{}", line);
    }
    out
}

pub fn print_chat_list(chats: &[Chat]) {
    print!("{}", format_chat_list(chats));
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Format the documents stored in a knowledge base
pub fn format_document_list(documents: &[DocumentRecord]) -> String {
    if documents.is_empty() {
        return format!("{}\n", "No documents yet".dimmed());
    }

    let name_width = documents
        .iter()
        .map(|d| d.file_name.chars().count())
        .max()
        .unwrap_or(0);

    let mut out = String::new();
    for document in documents {
        let size = document.file_size.map(human_size).unwrap_or_default();
        let status = match document.latest_task() {
            Some(task) => match &task.error_message {
                Some(error) => format!("{}: {}", task.status, error).red().to_string(),
                None if task.status == "completed" => task.status.green().to_string(),
                None => task.status.yellow().to_string(),
            },
            None => String::new(),
        };
        let line = format!(
            "#{:<4} {:<width$}  {:>9}  {}",
            document.id,
            document.file_name,
            size,
            status,
            width = name_width
        );
        let _ = writeln!(out, "{}", line.trim_end());
    }
    out
}

pub fn print_document_list(documents: &[DocumentRecord]) {
    print!("{}", format_document_list(documents));
}

/// Display help message
pub fn print_help() {
    println!("{}", "Available commands:".bold());
    println!("  {} - Ask a question about the chat's knowledge bases", "<question>".green());
    println!("  {} - Show this help message", "help".green());
    println!("  {} - Leave the chat", "exit/quit".green());
}

pub fn print_relogin_hint() {
    eprintln!(
        "{} Session expired. Run {} and export RAGDESK_TOKEN.",
        "🔐".yellow(),
        "ragdesk login".bold()
    );
}
