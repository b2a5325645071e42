//! Script directive scanning
//!
//! The model asks for code to be run by wrapping it in a marker pair, e.g.
//! `<run>print(1+1)</run>`. This module finds those regions in finished text,
//! strips them from what the user sees, and hides them from a live text
//! stream even when a marker is split across two deltas.

use crate::error::{Error, Result};
use regex::Regex;

/// Open/close marker pair delimiting a script body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectiveMarkers {
    pub open: String,
    pub close: String,
}

impl DirectiveMarkers {
    pub fn new(open: impl Into<String>, close: impl Into<String>) -> Self {
        Self {
            open: open.into(),
            close: close.into(),
        }
    }
}

impl Default for DirectiveMarkers {
    fn default() -> Self {
        Self::new("<run>", "</run>")
    }
}

/// A script body paired with the prose that preceded it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptDirective {
    pub code: String,
    pub preceding_text: String,
}

/// Compiled matcher for one marker pair
#[derive(Debug, Clone)]
pub struct DirectiveScanner {
    markers: DirectiveMarkers,
    pattern: Regex,
}

impl DirectiveScanner {
    /// Builds a scanner. Fails when either marker is empty.
    pub fn new(markers: DirectiveMarkers) -> Result<Self> {
        if markers.open.is_empty() || markers.close.is_empty() {
            return Err(Error::config("directive markers must not be empty"));
        }
        let source = format!(
            "(?s){}(.*?){}",
            regex::escape(&markers.open),
            regex::escape(&markers.close)
        );
        let pattern = Regex::new(&source).map_err(|e| Error::config(e.to_string()))?;
        Ok(Self { markers, pattern })
    }

    pub fn markers(&self) -> &DirectiveMarkers {
        &self.markers
    }

    /// All directives in `text`, in order of appearance.
    ///
    /// Bodies are trimmed; a region that is empty after trimming is not a
    /// directive. `preceding_text` is the text between the previous marker
    /// pair (or the start) and this one.
    pub fn extract(&self, text: &str) -> Vec<ScriptDirective> {
        let mut directives = Vec::new();
        let mut last_end = 0;

        for caps in self.pattern.captures_iter(text) {
            let (Some(whole), Some(body)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let code = body.as_str().trim();
            if !code.is_empty() {
                directives.push(ScriptDirective {
                    code: code.to_string(),
                    preceding_text: text[last_end..whole.start()].to_string(),
                });
            }
            last_end = whole.end();
        }

        directives
    }

    pub fn has_directives(&self, text: &str) -> bool {
        !self.extract(text).is_empty()
    }

    /// Removes every marker pair and its body, leaving surrounding text untouched
    pub fn strip(&self, text: &str) -> String {
        self.pattern.replace_all(text, "").into_owned()
    }

    /// A fresh streaming filter for the same markers
    pub fn filter(&self) -> MarkupFilter {
        MarkupFilter::new(self.markers.clone())
    }
}

/// Incremental version of [`DirectiveScanner::strip`] for live text deltas.
///
/// Text that might be the start of a marker is held back until the next
/// chunk settles it, so a marker split across deltas never reaches the
/// screen.
#[derive(Debug, Clone)]
pub struct MarkupFilter {
    markers: DirectiveMarkers,
    pending: String,
    inside: bool,
}

impl MarkupFilter {
    pub fn new(markers: DirectiveMarkers) -> Self {
        Self {
            markers,
            pending: String::new(),
            inside: false,
        }
    }

    /// Feeds one delta and returns the text that is now safe to display
    pub fn push(&mut self, chunk: &str) -> String {
        self.pending.push_str(chunk);
        let mut visible = String::new();

        loop {
            if self.inside {
                match self.pending.find(&self.markers.close) {
                    Some(pos) => {
                        self.pending.drain(..pos + self.markers.close.len());
                        self.inside = false;
                    }
                    None => {
                        let keep = partial_suffix(&self.pending, &self.markers.close);
                        self.pending.drain(..self.pending.len() - keep);
                        break;
                    }
                }
            } else {
                match self.pending.find(&self.markers.open) {
                    Some(pos) => {
                        visible.push_str(&self.pending[..pos]);
                        self.pending.drain(..pos + self.markers.open.len());
                        self.inside = true;
                    }
                    None => {
                        let keep = partial_suffix(&self.pending, &self.markers.open);
                        let split = self.pending.len() - keep;
                        visible.push_str(&self.pending[..split]);
                        self.pending.drain(..split);
                        break;
                    }
                }
            }
        }

        visible
    }

    /// Flushes held-back text at the end of a turn. An unterminated script
    /// body is dropped.
    pub fn finish(&mut self) -> String {
        let rest = if self.inside {
            String::new()
        } else {
            std::mem::take(&mut self.pending)
        };
        self.pending.clear();
        self.inside = false;
        rest
    }
}

/// Byte length of the longest proper prefix of `marker` that `text` ends with
fn partial_suffix(text: &str, marker: &str) -> usize {
    (1..marker.len())
        .rev()
        .filter(|&len| marker.is_char_boundary(len))
        .find(|&len| text.ends_with(&marker[..len]))
        .unwrap_or(0)
}

/// Builds the message that carries script output back to the model
pub fn format_feedback(outputs: &[String]) -> String {
    let mut feedback = String::from("Script execution results:\n\n");
    for output in outputs {
        feedback.push_str("```\n");
        feedback.push_str(output);
        feedback.push_str("\n```\n\n");
    }
    feedback
}
