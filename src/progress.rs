//! Shared progress and logging helpers to keep progress bars pinned.

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::{self, Write};
use std::sync::OnceLock;
use std::time::Duration;
use tracing_subscriber::fmt::MakeWriter;

static MULTI_PROGRESS: OnceLock<MultiProgress> = OnceLock::new();

fn multi_progress() -> &'static MultiProgress {
    MULTI_PROGRESS.get_or_init(|| {
        let mp = MultiProgress::new();
        mp.set_draw_target(ProgressDrawTarget::stderr_with_hz(10));
        mp
    })
}

/// Spinner for one ingestion run; the document count is not known up front
pub struct RunProgress {
    bar: ProgressBar,
}

impl RunProgress {
    /// A hidden spinner still counts, so callers never branch on visibility
    pub fn start(label: &str, visible: bool) -> Self {
        let bar = if visible {
            let bar = multi_progress().add(ProgressBar::new_spinner());
            bar.set_style(
                ProgressStyle::with_template(
                    "{spinner:.green} [{elapsed_precise}] {pos} documents {msg}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
            );
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        } else {
            ProgressBar::hidden()
        };
        bar.set_message(label.to_string());
        Self { bar }
    }

    pub fn document_done(&self, origin: &str, outcome: &str) {
        self.bar.inc(1);
        self.bar.set_message(format!("{} {}", outcome, origin));
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    pub fn finish(self, summary: &str) {
        self.bar.finish_with_message(summary.to_string());
    }
}

#[derive(Default, Clone)]
pub struct LogWriterFactory;

/// Line-buffered stderr writer that pauses progress bars while it prints
pub struct LogWriter {
    buffer: String,
}

impl LogWriter {
    fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    fn emit(line: &str) {
        multi_progress().suspend(|| {
            let _ = writeln!(io::stderr().lock(), "{}", line);
        });
    }

    fn flush_buffer(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        Self::emit(self.buffer.trim_end_matches(['\n', '\r']));
        self.buffer.clear();
    }
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.push_str(&String::from_utf8_lossy(buf));

        while let Some(idx) = self.buffer.find('\n') {
            Self::emit(self.buffer[..idx].trim_end_matches('\r'));
            self.buffer.drain(..idx + 1);
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buffer();
        Ok(())
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

impl<'a> MakeWriter<'a> for LogWriterFactory {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_progress_still_counts() {
        let progress = RunProgress::start("ingesting", false);
        progress.document_done("a.md", "created");
        progress.document_done("b.md", "skipped");
        assert_eq!(progress.position(), 2);
        progress.finish("done");
    }

    #[test]
    fn test_log_writer_buffers_partial_lines() {
        let mut writer = LogWriterFactory.make_writer();
        writer.write_all(b"partial").unwrap();
        assert_eq!(writer.buffer, "partial");
        writer.write_all(b" line\nnext").unwrap();
        assert_eq!(writer.buffer, "next");
        writer.flush().unwrap();
        assert!(writer.buffer.is_empty());
    }
}
