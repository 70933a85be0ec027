use std::backtrace::Backtrace;

use regex::Regex;

/// Symbol prefixes dropped by [`StackFilter::Default`]: runtime, std and
/// this crate's own frames, which say nothing about where an action came from.
const DEFAULT_EXCLUDED: &[&str] = &[
    "std::",
    "core::",
    "alloc::",
    "tokio::",
    "futures",
    "rewind_client::",
    "backtrace::",
    "__rust",
    "rust_begin_unwind",
    "_start",
    "__libc_start",
];

/// Which frames make it into a captured stack trace.
#[derive(Clone, Debug, Default)]
pub enum StackFilter {
    /// Drop runtime and library frames.
    #[default]
    Default,
    /// Keep every frame.
    All,
    /// Keep frames whose rendered line (`at symbol (file:line:col)`) matches.
    Include(Regex),
}

impl StackFilter {
    fn keeps(&self, symbol: &str, line: &str) -> bool {
        match self {
            Self::All => true,
            Self::Include(re) => re.is_match(line),
            Self::Default => {
                let symbol = symbol.trim_start_matches('<');
                !DEFAULT_EXCLUDED.iter().any(|p| symbol.starts_with(p))
            }
        }
    }
}

/// Stack capture settings for dispatched actions.
#[derive(Clone, Debug, Default)]
pub struct StackTraceOptions {
    pub enabled: bool,
    /// Maximum frames kept after filtering. 0 keeps all.
    pub limit: usize,
    pub filter: StackFilter,
}

impl StackTraceOptions {
    /// Capture the caller's stack, or `None` when disabled.
    pub fn capture(&self) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let backtrace = Backtrace::force_capture();
        Some(self.render(&backtrace.to_string()))
    }

    /// Turn std's backtrace text into `at symbol (location)` lines joined by CRLF.
    pub fn render(&self, backtrace: &str) -> String {
        let max = if self.limit == 0 { usize::MAX } else { self.limit };
        parse_frames(backtrace)
            .into_iter()
            .filter(|f| self.filter.keeps(&f.symbol, &f.line()))
            .take(max)
            .map(|f| f.line())
            .collect::<Vec<_>>()
            .join("\r\n")
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Frame {
    symbol: String,
    location: Option<String>,
}

impl Frame {
    fn line(&self) -> String {
        match &self.location {
            Some(loc) => format!("at {} ({})", self.symbol, loc),
            None => format!("at {}", self.symbol),
        }
    }
}

// std renders frames as
//   "  12: path::to::symbol"
//   "             at ./src/file.rs:10:5"
fn parse_frames(text: &str) -> Vec<Frame> {
    let mut frames: Vec<Frame> = Vec::new();
    for raw in text.lines() {
        let line = raw.trim();
        if let Some(loc) = line.strip_prefix("at ") {
            if let Some(last) = frames.last_mut() {
                if last.location.is_none() {
                    last.location = Some(loc.to_string());
                }
            }
            continue;
        }
        if let Some((index, symbol)) = line.split_once(": ") {
            if !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()) {
                frames.push(Frame {
                    symbol: symbol.to_string(),
                    location: None,
                });
            }
        }
    }
    frames
}
