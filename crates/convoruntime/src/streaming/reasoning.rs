/// Drops everything between a start and end tag, across token boundaries.
#[derive(Debug, Clone)]
pub struct ReasoningFilter {
    start: String,
    end: String,
    inside: bool,
    pending: String,
}

impl ReasoningFilter {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
            inside: false,
            pending: String::new(),
        }
    }

    pub fn is_inside(&self) -> bool {
        self.inside
    }

    /// Feed one token; returns the visible text it releases.
    pub fn push(&mut self, token: &str) -> String {
        if self.start.is_empty() || self.end.is_empty() {
            return token.to_string();
        }

        self.pending.push_str(token);
        let mut visible = String::new();

        loop {
            if self.inside {
                if let Some(index) = self.pending.find(&self.end) {
                    self.pending.drain(..index + self.end.len());
                    self.inside = false;
                    continue;
                }
                // Keep only what could still be the start of the end tag.
                let keep = partial_tag_suffix(&self.pending, &self.end);
                let cut = self.pending.len() - keep;
                self.pending.drain(..cut);
                break;
            }

            if let Some(index) = self.pending.find(&self.start) {
                visible.push_str(&self.pending[..index]);
                self.pending.drain(..index + self.start.len());
                self.inside = true;
                continue;
            }

            let keep = partial_tag_suffix(&self.pending, &self.start);
            let cut = self.pending.len() - keep;
            visible.push_str(&self.pending[..cut]);
            self.pending.drain(..cut);
            break;
        }

        visible
    }

    /// Flush at end of stream. An unterminated hidden span stays hidden.
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        if self.inside {
            String::new()
        } else {
            rest
        }
    }
}

/// Length of the longest proper suffix of `text` that is a prefix of `tag`.
fn partial_tag_suffix(text: &str, tag: &str) -> usize {
    text.char_indices()
        .map(|(index, _)| index)
        .find(|&index| text.len() - index < tag.len() && tag.starts_with(&text[index..]))
        .map(|index| text.len() - index)
        .unwrap_or(0)
}
