use std::io::{self, BufRead, Write};

/// Interactive channel used when partitions or stores are ambiguous
pub trait UserPrompt {
    fn write(&mut self, text: &str);

    /// Next answer, `None` when input ended or was aborted
    fn read_line(&mut self) -> Option<String>;
}

/// Prompt over any reader and writer
pub struct ReaderPrompt<R, W> {
    reader: R,
    writer: W,
    lines_read: usize,
}

impl<R: BufRead, W: Write> ReaderPrompt<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        ReaderPrompt { reader, writer, lines_read: 0 }
    }

    /// Number of answers requested so far
    pub fn lines_read(&self) -> usize {
        self.lines_read
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }
}

impl<R: BufRead, W: Write> UserPrompt for ReaderPrompt<R, W> {
    fn write(&mut self, text: &str) {
        let _ = self.writer.write_all(text.as_bytes());
        let _ = self.writer.flush();
    }

    fn read_line(&mut self) -> Option<String> {
        self.lines_read += 1;
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line),
        }
    }
}

/// Prompt on the terminal
pub struct ConsolePrompt {
    inner: ReaderPrompt<io::StdinLock<'static>, io::Stdout>,
}

impl ConsolePrompt {
    pub fn new() -> Self {
        ConsolePrompt {
            inner: ReaderPrompt::new(io::stdin().lock(), io::stdout()),
        }
    }
}

impl Default for ConsolePrompt {
    fn default() -> Self {
        Self::new()
    }
}

impl UserPrompt for ConsolePrompt {
    fn write(&mut self, text: &str) {
        self.inner.write(text);
    }

    fn read_line(&mut self) -> Option<String> {
        self.inner.read_line()
    }
}
