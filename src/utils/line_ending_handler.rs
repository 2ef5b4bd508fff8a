use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEndingStyle {
    Lf,
    CrLf,
    Cr,
    /// No line breaks at all.
    Unknown,
}

impl LineEndingStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineEndingStyle::Lf => "\n",
            LineEndingStyle::CrLf => "\r\n",
            LineEndingStyle::Cr => "\r",
            LineEndingStyle::Unknown => native().as_str(),
        }
    }
}

pub fn native() -> LineEndingStyle {
    if cfg!(windows) {
        LineEndingStyle::CrLf
    } else {
        LineEndingStyle::Lf
    }
}

/// Tallies line breaks over text that arrives in pieces. A CR closing one
/// piece pairs with an LF opening the next.
#[derive(Debug, Default)]
pub struct LineEndingCounter {
    lf: usize,
    crlf: usize,
    cr: usize,
    pending_cr: bool,
}

impl LineEndingCounter {
    pub fn feed(&mut self, text: &str) {
        for b in text.bytes() {
            if self.pending_cr {
                self.pending_cr = false;
                if b == b'\n' {
                    self.crlf += 1;
                    continue;
                }
                self.cr += 1;
            }
            match b {
                b'\r' => self.pending_cr = true,
                b'\n' => self.lf += 1,
                _ => {}
            }
        }
    }

    /// The predominant style; ties prefer CRLF, then LF.
    pub fn finish(mut self) -> LineEndingStyle {
        if self.pending_cr {
            self.cr += 1;
        }
        let (lf, crlf, cr) = (self.lf, self.crlf, self.cr);
        trace!(lf, crlf, cr, "Counted line endings");

        if crlf + lf + cr == 0 {
            LineEndingStyle::Unknown
        } else if crlf >= lf && crlf >= cr {
            LineEndingStyle::CrLf
        } else if lf >= cr {
            LineEndingStyle::Lf
        } else {
            LineEndingStyle::Cr
        }
    }
}

/// The predominant line ending in `content`; ties prefer CRLF, then LF.
pub fn detect_line_ending(content: &str) -> LineEndingStyle {
    let mut counter = LineEndingCounter::default();
    counter.feed(content);
    counter.finish()
}

/// Rewrites line breaks to one style over text that arrives in pieces.
#[derive(Debug)]
pub struct LineEndingNormalizer {
    target: &'static str,
    pending_cr: bool,
}

impl LineEndingNormalizer {
    pub fn new(target: LineEndingStyle) -> Self {
        Self {
            target: target.as_str(),
            pending_cr: false,
        }
    }

    pub fn feed(&mut self, text: &str, out: &mut String) {
        for c in text.chars() {
            if self.pending_cr {
                self.pending_cr = false;
                out.push_str(self.target);
                if c == '\n' {
                    continue;
                }
            }
            match c {
                '\r' => self.pending_cr = true,
                '\n' => out.push_str(self.target),
                other => out.push(other),
            }
        }
    }

    /// Flushes a CR held back from the last piece.
    pub fn finish(&mut self, out: &mut String) {
        if std::mem::take(&mut self.pending_cr) {
            out.push_str(self.target);
        }
    }
}

/// Rewrites every line break in `text` to `target`.
pub fn normalize_line_endings(text: &str, target: LineEndingStyle) -> String {
    let mut normalizer = LineEndingNormalizer::new(target);
    let mut out = String::with_capacity(text.len());
    normalizer.feed(text, &mut out);
    normalizer.finish(&mut out);
    out
}
