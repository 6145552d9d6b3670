//! Lifecycle event stream.
//!
//! Every supervisor and worker transition is written as one logfmt line:
//!
//! ```text
//! source=drover:supervisor pid=4242 event="worker 1 online"
//! ```

use parking_lot::Mutex;
use std::{
    fmt::Write as _,
    io::{self, Write},
    sync::Arc,
};

pub type Sink = Box<dyn Write + Send>;

/// Which side of the pool wrote a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Supervisor,
    Worker,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Supervisor => "drover:supervisor",
            Source::Worker => "drover:worker",
        }
    }
}

struct EventLoggerInner {
    source: Source,
    pid: u32,
    sink: Mutex<Sink>,
}

/// Writes ordered key/value records to a sink. Cheap to clone; clones share
/// the sink.
#[derive(Clone)]
pub struct EventLogger {
    inner: Option<Arc<EventLoggerInner>>,
}

impl std::fmt::Debug for EventLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            Some(inner) => f
                .debug_struct("EventLogger")
                .field("source", &inner.source)
                .field("pid", &inner.pid)
                .finish(),
            None => f.write_str("EventLogger(discard)"),
        }
    }
}

impl EventLogger {
    /// A logger for the current process. A non-verbose logger discards
    /// everything; without a sink, lines go to stdout.
    pub fn new(source: Source, verbose: bool, sink: Option<Sink>) -> Self {
        if !verbose {
            return Self::discard();
        }
        Self::with_pid(source, std::process::id(), sink)
    }

    pub fn with_pid(source: Source, pid: u32, sink: Option<Sink>) -> Self {
        let sink = sink.unwrap_or_else(|| Box::new(io::stdout()));
        Self {
            inner: Some(Arc::new(EventLoggerInner {
                source,
                pid,
                sink: Mutex::new(sink),
            })),
        }
    }

    pub fn discard() -> Self {
        Self { inner: None }
    }

    pub fn is_discard(&self) -> bool {
        self.inner.is_none()
    }

    pub fn log(&self, record: &[(&str, &str)]) {
        let Some(inner) = &self.inner else {
            return;
        };
        let line = format_record(inner.source, inner.pid, record);
        let mut sink = inner.sink.lock();
        if let Err(e) = sink.write_all(line.as_bytes()).and_then(|_| sink.flush()) {
            tracing::warn!("Failed to write lifecycle event: {}", e);
        }
    }

    /// Shorthand for a record holding just an `event` key.
    pub fn event(&self, event: impl AsRef<str>) {
        self.log(&[("event", event.as_ref())]);
    }
}

pub(crate) fn format_record(source: Source, pid: u32, record: &[(&str, &str)]) -> String {
    let mut line = format!("source={} pid={}", source.as_str(), pid);
    for (key, value) in record {
        line.push(' ');
        line.push_str(key);
        line.push('=');
        push_value(&mut line, value);
    }
    line.push('\n');
    line
}

fn push_value(line: &mut String, value: &str) {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c == ' ' || c == '=' || c == '"' || c.is_control());
    if !needs_quotes {
        line.push_str(value);
        return;
    }
    line.push('"');
    for c in value.chars() {
        match c {
            '"' => line.push_str("\\\""),
            '\\' => line.push_str("\\\\"),
            '\n' => line.push_str("\\n"),
            '\t' => line.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(line, "\\u{{{:x}}}", c as u32);
            }
            c => line.push(c),
        }
    }
    line.push('"');
}

/// In-memory sink, handy for asserting on the event stream.
#[derive(Clone, Default)]
pub struct MemorySink(Arc<Mutex<Vec<u8>>>);

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn boxed(&self) -> Sink {
        Box::new(self.clone())
    }

    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock())
            .lines()
            .map(str::to_owned)
            .collect()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_quotes_values_with_spaces() {
        let line = format_record(Source::Supervisor, 12, &[("event", "worker 1 online")]);
        assert_eq!(line, "source=drover:supervisor pid=12 event=\"worker 1 online\"\n");
    }

    #[test]
    fn test_format_keeps_bare_values_and_order() {
        let line = format_record(Source::Worker, 7, &[("foo", "bar"), ("status", "1")]);
        assert_eq!(line, "source=drover:worker pid=7 foo=bar status=1\n");
    }

    #[test]
    fn test_format_escapes_quotes_and_backslashes() {
        let line = format_record(Source::Worker, 7, &[("msg", r#"say "hi" \o/"#)]);
        assert_eq!(line, "source=drover:worker pid=7 msg=\"say \\\"hi\\\" \\\\o/\"\n");
    }

    #[test]
    fn test_format_quotes_empty_and_equals() {
        let line = format_record(Source::Worker, 1, &[("a", ""), ("b", "x=y")]);
        assert_eq!(line, "source=drover:worker pid=1 a=\"\" b=\"x=y\"\n");
    }

    #[test]
    fn test_logger_writes_to_sink() {
        let sink = MemorySink::new();
        let logger = EventLogger::with_pid(Source::Supervisor, 99, Some(sink.boxed()));
        logger.event("all workers exited");
        logger.log(&[("foo", "bar")]);
        assert_eq!(
            sink.lines(),
            vec![
                "source=drover:supervisor pid=99 event=\"all workers exited\"",
                "source=drover:supervisor pid=99 foo=bar",
            ]
        );
    }

    #[test]
    fn test_non_verbose_logger_discards() {
        let sink = MemorySink::new();
        let logger = EventLogger::new(Source::Worker, false, Some(sink.boxed()));
        assert!(logger.is_discard());
        logger.event("received TERM, attempting graceful shutdown");
        assert!(sink.lines().is_empty());
    }

    #[test]
    fn test_verbose_logger_uses_own_pid() {
        let sink = MemorySink::new();
        let logger = EventLogger::new(Source::Worker, true, Some(sink.boxed()));
        logger.log(&[("foo", "bar")]);
        assert_eq!(
            sink.lines(),
            vec![format!("source=drover:worker pid={} foo=bar", std::process::id())]
        );
    }

    #[test]
    fn test_clones_share_sink() {
        let sink = MemorySink::new();
        let logger = EventLogger::with_pid(Source::Worker, 3, Some(sink.boxed()));
        let clone = logger.clone();
        logger.event("one");
        clone.event("two");
        assert_eq!(sink.lines().len(), 2);
    }
}
