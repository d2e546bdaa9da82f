/*
 * apkzip v1.0.0
 * Copyright (c) 2026 Tiash H Kabir / @MrCarb0n.
 * Licensed under the MIT License.
 */

//! Terminal output of the command line tool. Everything but `--version`
//! goes to stderr so signed archives can be piped.

use crate::{APP_ABOUT, APP_AUTHOR, APP_NAME, APP_VERSION};
use colored::{ColoredString, Colorize};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// How much the tool reports, from `-q` up to `-vvv`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
    VeryVerbose,
    Debug,
}

impl Verbosity {
    /// `-q` wins over any number of `-v`.
    pub fn from_flags(verbose_count: u8, quiet: bool) -> Self {
        match (quiet, verbose_count) {
            (true, _) => Self::Quiet,
            (false, 0) => Self::Normal,
            (false, 1) => Self::Verbose,
            (false, 2) => Self::VeryVerbose,
            _ => Self::Debug,
        }
    }
}

/// Message kinds, each shown from a minimum verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Error,
    Success,
    Step,
    Detail,
    KeyInfo,
    Trace,
}

impl Kind {
    fn threshold(self) -> Verbosity {
        match self {
            Kind::Error => Verbosity::Quiet,
            Kind::Success => Verbosity::Normal,
            Kind::Step | Kind::Detail => Verbosity::Verbose,
            Kind::KeyInfo => Verbosity::VeryVerbose,
            Kind::Trace => Verbosity::Debug,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            Kind::Error => "[x]",
            Kind::Success => "[+]",
            Kind::Step => "[i]",
            Kind::Detail => "[v]",
            Kind::KeyInfo => "[vv]",
            Kind::Trace => "[dbg]",
        }
    }

    fn paint_tag(self) -> ColoredString {
        let tag = self.tag();
        match self {
            Kind::Error => tag.red().bold(),
            Kind::Success => tag.green().bold(),
            Kind::Step => tag.blue().bold(),
            Kind::Detail | Kind::KeyInfo | Kind::Trace => tag.dimmed(),
        }
    }
}

pub struct Ui {
    verbosity: Verbosity,
    colors: bool,
    stage: Mutex<Option<ProgressBar>>,
}

impl Default for Ui {
    fn default() -> Self {
        Self::new(Verbosity::Normal, true)
    }
}

impl Ui {
    /// Colors are dropped when `colors` is off or `NO_COLOR` is set.
    pub fn new(verbosity: Verbosity, colors: bool) -> Self {
        let colors = colors && std::env::var_os("NO_COLOR").is_none();
        #[cfg(windows)]
        colored::control::set_override(colors);
        Self {
            verbosity,
            colors,
            stage: Mutex::new(None),
        }
    }

    pub fn shows(&self, level: Verbosity) -> bool {
        self.verbosity >= level
    }

    /// Spinner for a long packaging stage, cleared by [`end_stage`](Self::end_stage).
    pub fn begin_stage(&self, what: &str) {
        if !self.shows(Verbosity::Normal) {
            return;
        }
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg} ({elapsed})")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["[|]", "[/]", "[-]", "[\\]", "[+]"]);
        let bar = ProgressBar::new_spinner()
            .with_style(style)
            .with_message(shorten(what, term_width()));
        bar.enable_steady_tick(Duration::from_millis(120));
        if let Some(previous) = self.stage_slot().replace(bar) {
            previous.finish_and_clear();
        }
    }

    pub fn end_stage(&self) {
        if let Some(bar) = self.stage_slot().take() {
            bar.finish_and_clear();
        }
    }

    fn stage_slot(&self) -> std::sync::MutexGuard<'_, Option<ProgressBar>> {
        self.stage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn error(&self, msg: &str) {
        self.emit(Kind::Error, msg);
    }

    pub fn success(&self, msg: &str) {
        self.emit(Kind::Success, msg);
    }

    /// Progress through the packaging steps (`-v`).
    pub fn step(&self, msg: &str) {
        self.emit(Kind::Step, msg);
    }

    /// Paths and choices behind a step (`-v`).
    pub fn detail(&self, msg: &str) {
        self.emit(Kind::Detail, msg);
    }

    /// Key material details (`-vv`).
    pub fn key_info(&self, msg: &str) {
        self.emit(Kind::KeyInfo, msg);
    }

    /// Argument resolution (`-vvv`).
    pub fn trace(&self, msg: &str) {
        self.emit(Kind::Trace, msg);
    }

    fn emit(&self, kind: Kind, msg: &str) {
        if !self.shows(kind.threshold()) {
            return;
        }
        let dimmed = matches!(kind, Kind::Detail | Kind::KeyInfo | Kind::Trace);
        let indent = kind.tag().len() + 1;
        let text = wrap_words(msg, term_width(), indent);
        let mut out = String::new();
        for (i, line) in text.lines().enumerate() {
            if i > 0 {
                out.push('\n');
                out.push_str(&" ".repeat(indent));
            } else if self.colors {
                out.push_str(&format!("{} ", kind.paint_tag()));
            } else {
                out.push_str(kind.tag());
                out.push(' ');
            }
            if self.colors && dimmed {
                out.push_str(&line.dimmed().to_string());
            } else {
                out.push_str(line);
            }
        }
        self.print(&out);
    }

    fn print(&self, text: &str) {
        match self.stage_slot().as_ref() {
            Some(bar) => bar.suspend(|| eprintln!("{}", text)),
            None => eprintln!("{}", text),
        }
    }

    /// Name and version, shown with `-v`.
    pub fn banner(&self) {
        if !self.shows(Verbosity::Verbose) {
            return;
        }
        let title = format!("{} v{}", APP_NAME, APP_VERSION);
        if self.colors {
            eprintln!("{}", title.cyan().bold());
        } else {
            eprintln!("{}", title);
        }
    }

    /// `--version` output, on stdout.
    pub fn version_info(&self) {
        let lines = [
            format!("{} {}", APP_NAME, APP_VERSION),
            format!("Author:      {}", APP_AUTHOR),
            "License:     MIT".to_string(),
            format!("Description: {}", APP_ABOUT),
        ];
        for (i, line) in lines.iter().enumerate() {
            if self.colors && i == 0 {
                println!("{}", line.cyan().bold());
            } else {
                println!("{}", line);
            }
        }
    }

    /// Title of the operation about to run (`-v`).
    pub fn section(&self, title: &str) {
        if !self.shows(Verbosity::Verbose) {
            return;
        }
        let header = format!("== {} ==", title);
        if self.colors {
            eprintln!("\n{}", header.yellow().bold());
        } else {
            eprintln!("\n{}", header);
        }
    }

    /// Aligned `key value` table, shown with `-v`.
    pub fn report(&self, title: &str, fields: &[(&str, String)]) {
        if !self.shows(Verbosity::Verbose) {
            return;
        }
        if self.colors {
            eprintln!("{}", format!("{}:", title).green().bold());
        } else {
            eprintln!("{}:", title);
        }
        for line in report_lines(fields, term_width()) {
            eprintln!("{}", line);
        }
    }
}

/// Rows of a report: keys padded to a common width, values wrapped under
/// themselves.
fn report_lines(fields: &[(&str, String)], width: usize) -> Vec<String> {
    let key_width = fields.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    let indent = key_width + 3;
    let mut lines = Vec::new();
    for (key, value) in fields {
        for (i, part) in wrap_words(value, width, indent).lines().enumerate() {
            if i == 0 {
                lines.push(format!("  {:<w$} {}", key, part, w = key_width));
            } else {
                lines.push(format!("{}{}", " ".repeat(indent), part));
            }
        }
    }
    lines
}

/// Cut `msg` so a spinner line fits narrow terminals.
fn shorten(msg: &str, width: usize) -> String {
    let budget = match width {
        0..=59 => 16,
        60..=79 => 32,
        _ => return msg.to_string(),
    };
    if msg.chars().count() <= budget {
        return msg.to_string();
    }
    let mut short: String = msg.chars().take(budget).collect();
    short.push_str("...");
    short
}

/// Greedy word wrap to `width - indent` columns (at least 10); words longer
/// than a line are split.
fn wrap_words(msg: &str, width: usize, indent: usize) -> String {
    let columns = width.saturating_sub(indent).max(10);
    let mut lines: Vec<String> = Vec::new();
    let mut line = String::new();
    let mut line_len = 0;

    for word in msg.split_whitespace() {
        let chars: Vec<char> = word.chars().collect();
        if line_len > 0 && line_len + 1 + chars.len() <= columns {
            line.push(' ');
            line.extend(&chars);
            line_len += 1 + chars.len();
            continue;
        }
        if line_len > 0 {
            lines.push(std::mem::take(&mut line));
        }
        let mut chunks = chars.chunks(columns).peekable();
        while let Some(chunk) = chunks.next() {
            line = chunk.iter().collect();
            line_len = chunk.len();
            if chunks.peek().is_some() {
                lines.push(std::mem::take(&mut line));
            }
        }
    }
    if line_len > 0 {
        lines.push(line);
    }
    lines.join("\n")
}

fn term_width() -> usize {
    std::env::var("COLUMNS")
        .ok()
        .and_then(|s| s.parse().ok())
        .or_else(|| terminal_size::terminal_size().map(|(w, _)| w.0 as usize))
        .unwrap_or(80)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_overrides_verbose_flags() {
        assert_eq!(Verbosity::from_flags(3, true), Verbosity::Quiet);
        assert_eq!(Verbosity::from_flags(0, false), Verbosity::Normal);
        assert_eq!(Verbosity::from_flags(2, false), Verbosity::VeryVerbose);
        assert_eq!(Verbosity::from_flags(7, false), Verbosity::Debug);
    }

    #[test]
    fn errors_show_even_when_quiet() {
        let ui = Ui::new(Verbosity::Quiet, false);
        assert!(ui.shows(Kind::Error.threshold()));
        assert!(!ui.shows(Kind::Success.threshold()));
        let ui = Ui::new(Verbosity::Verbose, false);
        assert!(ui.shows(Kind::Detail.threshold()));
        assert!(!ui.shows(Kind::KeyInfo.threshold()));
    }

    #[test]
    fn wraps_on_word_boundaries() {
        let wrapped = wrap_words("aaaa bbbb cccc dddd eeee ffff", 24, 0);
        assert_eq!(wrapped, "aaaa bbbb cccc dddd eeee\nffff");
    }

    #[test]
    fn splits_long_words() {
        let word = "x".repeat(45);
        let wrapped = wrap_words(&format!("ab {}", word), 20, 0);
        let lines: Vec<&str> = wrapped.split('\n').collect();
        assert_eq!(lines, ["ab", &word[..20], &word[20..40], &word[40..]]);
    }

    #[test]
    fn report_values_wrap_under_themselves() {
        let fields = [
            ("Mode", "Standard".to_string()),
            ("Signer SHA-256", "AB:CD ".repeat(8).trim_end().to_string()),
        ];
        let lines = report_lines(&fields, 40);
        assert_eq!(lines[0], format!("  {:<14} Standard", "Mode"));
        assert!(lines[1].starts_with("  Signer SHA-256 AB:CD"));
        assert!(lines.len() > 2);
        assert!(lines[2].starts_with(&" ".repeat(17)));
    }

    #[test]
    fn spinner_text_is_shortened_on_narrow_terminals() {
        assert_eq!(shorten("abcdefghijklmnopqrstuvwxyz", 40), "abcdefghijklmnop...");
        assert_eq!(shorten("short", 40), "short");
        assert_eq!(shorten(&"y".repeat(100), 120).len(), 100);
    }
}
