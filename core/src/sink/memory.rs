use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::errors::SinkError;
use crate::sink::{DeadLetter, DeadLetterSink};

/// Keeps dead letters in memory. Clones share the same storage.
#[derive(Debug, Default, Clone)]
pub struct MemoryDeadLetterSink {
    letters: Arc<Mutex<Vec<DeadLetter>>>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .map(|letters| letters.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.letters.lock().map(|letters| letters.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn send(&self, letter: &DeadLetter) -> Result<(), SinkError> {
        let mut letters = self.letters.lock().map_err(|e| SinkError::Publish {
            destination: "memory".to_string(),
            reason: e.to_string(),
        })?;
        letters.push(letter.clone());
        Ok(())
    }
}
