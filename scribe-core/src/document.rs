//! The canonical document text.
//!
//! The only way to change the text is [`Document::apply`], which checks the
//! operation's range against the current length before touching anything.

use thiserror::Error;

use crate::operation::{OpKind, Operation};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    #[error("position {position} is past the end of the document (length {len})")]
    PositionOutOfBounds { position: usize, len: usize },
    #[error("delete of {count} characters at {position} overruns the document (length {len})")]
    RangeOutOfBounds {
        position: usize,
        count: usize,
        len: usize,
    },
}

/// Plain-text document addressed by character offsets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    text: String,
    /// Length in characters, kept in step with `text`
    len: usize,
    /// Number of operations applied so far
    version: u64,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        let len = text.chars().count();
        Self {
            text,
            len,
            version: 0,
        }
    }

    /// Validate and apply a single operation.
    ///
    /// On error the document is left exactly as it was.
    pub fn apply(&mut self, op: &Operation) -> Result<(), ApplyError> {
        if op.position > self.len {
            return Err(ApplyError::PositionOutOfBounds {
                position: op.position,
                len: self.len,
            });
        }

        let count = op.len();
        let start = self.byte_offset(op.position);
        match op.kind {
            OpKind::Insert => {
                self.text.insert_str(start, &op.content);
                self.len += count;
            }
            OpKind::Delete => {
                if op.end() > self.len {
                    return Err(ApplyError::RangeOutOfBounds {
                        position: op.position,
                        count,
                        len: self.len,
                    });
                }
                let end = self.byte_offset(op.end());
                self.text.replace_range(start..end, "");
                self.len -= count;
            }
        }

        self.version += 1;
        Ok(())
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Byte index of character offset `chars`; the caller guarantees
    /// `chars <= self.len`.
    fn byte_offset(&self, chars: usize) -> usize {
        self.text
            .char_indices()
            .nth(chars)
            .map_or(self.text.len(), |(index, _)| index)
    }
}
