/// Removes a leading pattern (e.g. `"Assistant:"`) from the start of a stream.
///
/// Text is held back while it could still turn into one of the patterns.
/// Once a pattern matches, the text can no longer match, or the buffer
/// reaches its ceiling, the decision is final and everything afterwards
/// passes straight through.
#[derive(Debug, Clone)]
pub struct PrefixStripper {
    patterns: Vec<String>,
    limit: usize,
    buffer: String,
    decided: bool,
    trim_next: bool,
}

enum Decision {
    Wait,
    Strip(usize),
    Release,
}

impl PrefixStripper {
    pub fn new(patterns: Vec<String>, limit: usize) -> Self {
        let patterns: Vec<String> = patterns.into_iter().filter(|p| !p.is_empty()).collect();
        Self {
            decided: patterns.is_empty(),
            patterns,
            limit,
            buffer: String::new(),
            trim_next: false,
        }
    }

    pub fn is_buffering(&self) -> bool {
        !self.decided
    }

    pub fn push(&mut self, text: &str) -> String {
        if self.decided {
            return self.pass_through(text);
        }

        self.buffer.push_str(text);
        match self.evaluate() {
            Decision::Strip(len) => self.release(Some(len)),
            Decision::Release => self.release(None),
            Decision::Wait if self.buffer.len() >= self.limit => self.release(None),
            Decision::Wait => String::new(),
        }
    }

    /// End of stream: whatever is still held is released.
    pub fn finish(&mut self) -> String {
        if self.decided {
            return String::new();
        }
        match self.evaluate() {
            Decision::Strip(len) => self.release(Some(len)),
            _ => self.release(None),
        }
    }

    fn evaluate(&self) -> Decision {
        let trimmed = self.buffer.trim_start();
        if trimmed.is_empty() {
            return Decision::Wait;
        }
        let leading = self.buffer.len() - trimmed.len();

        if let Some(pattern) = self.patterns.iter().find(|p| trimmed.starts_with(p.as_str())) {
            return Decision::Strip(leading + pattern.len());
        }
        if self.patterns.iter().any(|p| p.starts_with(trimmed)) {
            Decision::Wait
        } else {
            Decision::Release
        }
    }

    fn release(&mut self, strip: Option<usize>) -> String {
        self.decided = true;
        let buffered = std::mem::take(&mut self.buffer);
        match strip {
            Some(len) => {
                self.trim_next = true;
                self.pass_through(&buffered[len..])
            }
            None => buffered,
        }
    }

    fn pass_through(&mut self, text: &str) -> String {
        if !self.trim_next {
            return text.to_string();
        }
        let trimmed = text.trim_start();
        if !trimmed.is_empty() {
            self.trim_next = false;
        }
        trimmed.to_string()
    }
}
