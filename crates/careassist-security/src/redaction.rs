use std::io::Write;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use tracing_subscriber::fmt::MakeWriter;

/// Log writer that scrubs credentials before they reach the sink.
pub struct RedactingWriter<W> {
    inner: W,
}

impl RedactingWriter<std::io::Stderr> {
    pub fn stderr() -> Self {
        Self {
            inner: std::io::stderr(),
        }
    }
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let original = String::from_utf8_lossy(buf);
        let redacted = redact_secrets(&original);
        self.inner.write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl<'a> MakeWriter<'a> for RedactingWriter<std::io::Stderr> {
    type Writer = RedactingWriter<std::io::Stderr>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::stderr()
    }
}

static KEY_PATTERNS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
          sk-ant-\S{10,}          # Anthropic API keys
        | sk-\S{20,}              # OpenAI-style keys
        ",
    )
    .expect("redaction regex should compile")
});

// Keeps the label and replaces only the value.
static LABELED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(bearer\s+|x-api-key["']?\s*[:=]\s*["']?|api_key["']?\s*[:=]\s*["']?)[A-Za-z0-9._~+/=\-]{8,}"#)
        .expect("redaction regex should compile")
});

/// Replace API keys and bearer tokens with `[REDACTED]`.
pub fn redact_secrets(input: &str) -> String {
    let keys = KEY_PATTERNS.replace_all(input, "[REDACTED]");
    LABELED
        .replace_all(&keys, |caps: &Captures<'_>| format!("{}[REDACTED]", &caps[1]))
        .into_owned()
}
