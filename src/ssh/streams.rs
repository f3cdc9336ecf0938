//! Interactive stream driver
//!
//! [`ChannelStreams`] wraps a channel's reader and writer for line-oriented
//! conversations: write a line, then poll the output until a prompt shows up,
//! the channel closes, or a deadline passes.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::poll::{Poll, Wake};
use super::transport::{ChannelReader, ChannelWriter};
use crate::error::Result;

/// Why [`ChannelStreams::wait_for_prompt`] stopped
///
/// Every variant carries the text accumulated while waiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptOutcome {
    /// The prompt appeared in the output
    Matched(String),
    /// The deadline passed before the prompt appeared
    TimedOut(String),
    /// The channel closed before the prompt appeared
    ChannelClosed(String),
    /// The wait was cancelled
    Interrupted(String),
}

impl PromptOutcome {
    pub fn text(&self) -> &str {
        match self {
            PromptOutcome::Matched(text)
            | PromptOutcome::TimedOut(text)
            | PromptOutcome::ChannelClosed(text)
            | PromptOutcome::Interrupted(text) => text,
        }
    }

    pub fn into_text(self) -> String {
        match self {
            PromptOutcome::Matched(text)
            | PromptOutcome::TimedOut(text)
            | PromptOutcome::ChannelClosed(text)
            | PromptOutcome::Interrupted(text) => text,
        }
    }

    pub fn is_matched(&self) -> bool {
        matches!(self, PromptOutcome::Matched(_))
    }

    fn label(&self) -> &'static str {
        match self {
            PromptOutcome::Matched(_) => "matched",
            PromptOutcome::TimedOut(_) => "timed out",
            PromptOutcome::ChannelClosed(_) => "channel closed",
            PromptOutcome::Interrupted(_) => "interrupted",
        }
    }
}

/// Line-oriented reader/writer pair over one channel
#[derive(Debug)]
pub struct ChannelStreams {
    reader: ChannelReader,
    writer: ChannelWriter,
    buffer: Vec<u8>,
    // trailing bytes of a multi-byte character split across reads
    partial: Vec<u8>,
    interval: Duration,
    cancel: CancellationToken,
}

impl ChannelStreams {
    pub fn new(
        reader: ChannelReader,
        writer: ChannelWriter,
        buffer_size: usize,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            reader,
            writer,
            buffer: vec![0u8; buffer_size.max(1)],
            partial: Vec::new(),
            interval,
            cancel,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_closed()
    }

    /// Write `text` followed by a newline and flush
    pub fn write_line(&mut self, text: &str) -> Result<()> {
        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');
        self.writer.write(line.as_bytes())?;
        self.writer.flush()?;
        Ok(())
    }

    /// Decode whatever is buffered right now, without waiting
    pub fn read_available(&mut self) -> Option<String> {
        let n = self.reader.read(&mut self.buffer);
        if n == 0 {
            return None;
        }

        let mut pending = std::mem::take(&mut self.partial);
        pending.extend_from_slice(&self.buffer[..n]);
        let complete = complete_prefix_len(&pending);
        self.partial = pending.split_off(complete);

        if pending.is_empty() {
            return None;
        }
        Some(String::from_utf8_lossy(&pending).into_owned())
    }

    /// Read until nothing more is buffered
    fn drain_into(&mut self, out: &mut String) {
        while let Some(text) = self.read_available() {
            out.push_str(&text);
        }
    }

    /// Decode a held-back tail that can no longer be completed
    fn flush_partial(&mut self, out: &mut String) {
        if !self.partial.is_empty() {
            let tail = std::mem::take(&mut self.partial);
            out.push_str(&String::from_utf8_lossy(&tail));
        }
    }

    /// Collect output; with `wait_for_close`, keep polling until the channel closes
    pub async fn read_channel(&mut self, wait_for_close: bool) -> String {
        let poll = Poll::new(self.interval, &self.cancel);
        let mut output = String::new();
        loop {
            let closed = self.reader.is_closed();
            self.drain_into(&mut output);
            if closed {
                self.flush_partial(&mut output);
            }
            if !wait_for_close || closed {
                break;
            }
            if poll.sleep().await == Wake::Interrupted {
                debug!("Channel read interrupted");
                break;
            }
        }
        output
    }

    /// Wait until at least one byte can be read
    ///
    /// Returns `false` if the channel closed with nothing to read or the wait
    /// was cancelled.
    pub async fn wait_for_input(&mut self) -> bool {
        let poll = Poll::new(self.interval, &self.cancel);
        loop {
            if self.reader.available() > 0 {
                return true;
            }
            if self.reader.is_closed() {
                return self.reader.available() > 0;
            }
            if poll.sleep().await == Wake::Interrupted {
                return false;
            }
        }
    }

    /// Accumulate output until `prompt` appears, the channel closes, or
    /// `max_wait` elapses (`None` waits without limit)
    pub async fn wait_for_prompt(&mut self, prompt: &str, max_wait: Option<Duration>) -> PromptOutcome {
        let poll = Poll::new(self.interval, &self.cancel).with_max_wait(max_wait);
        let mut text = String::new();

        let outcome = loop {
            let closed = self.reader.is_closed();
            self.drain_into(&mut text);
            if closed {
                self.flush_partial(&mut text);
            }
            if text.contains(prompt) {
                break PromptOutcome::Matched(text);
            }
            if closed {
                break PromptOutcome::ChannelClosed(text);
            }
            match poll.sleep().await {
                Wake::Ready => {}
                Wake::Expired => {
                    self.drain_into(&mut text);
                    if text.contains(prompt) {
                        break PromptOutcome::Matched(text);
                    }
                    break PromptOutcome::TimedOut(text);
                }
                Wake::Interrupted => break PromptOutcome::Interrupted(text),
            }
        };

        debug!("Prompt '{}' wait {}", prompt, outcome.label());
        outcome
    }
}

/// Length of the longest prefix that does not end inside a UTF-8 sequence
fn complete_prefix_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let index = len - back;
        let byte = bytes[index];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if back < width { index } else { len };
    }
    len
}
