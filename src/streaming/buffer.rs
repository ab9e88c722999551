//! Token batching for streamed output

/// Collects tokens into chunks, flushing at a size limit or a sentence end
#[derive(Debug)]
pub struct ChunkBuffer {
    buffer: String,
    pending_tokens: usize,
    size: usize,
}

impl ChunkBuffer {
    pub fn new(size: usize) -> Self {
        Self {
            buffer: String::new(),
            pending_tokens: 0,
            size: size.max(1),
        }
    }

    /// Add a token; returns a chunk when one is ready
    pub fn push(&mut self, token: &str) -> Option<String> {
        self.buffer.push_str(token);
        self.pending_tokens += 1;

        if self.pending_tokens >= self.size || ends_sentence(token) {
            return self.take();
        }
        None
    }

    /// Flush whatever is left
    pub fn finish(&mut self) -> Option<String> {
        self.take()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    fn take(&mut self) -> Option<String> {
        self.pending_tokens = 0;
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}

fn ends_sentence(token: &str) -> bool {
    token.contains('\n') || token.trim_end().ends_with(&['.', '!', '?'][..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flushes_at_buffer_size() {
        let mut buffer = ChunkBuffer::new(3);
        assert_eq!(buffer.push("a "), None);
        assert_eq!(buffer.push("b "), None);
        assert_eq!(buffer.push("c "), Some("a b c ".to_string()));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_flushes_early_on_sentence_end() {
        let mut buffer = ChunkBuffer::new(10);
        assert_eq!(buffer.push("Hello"), None);
        assert_eq!(buffer.push(" world."), Some("Hello world.".to_string()));
        assert_eq!(buffer.push(" Next"), None);
        assert_eq!(buffer.push("\n"), Some(" Next\n".to_string()));
    }

    #[test]
    fn test_finish_drains_remainder() {
        let mut buffer = ChunkBuffer::new(10);
        buffer.push("partial");
        assert_eq!(buffer.finish(), Some("partial".to_string()));
        assert_eq!(buffer.finish(), None);
    }
}
