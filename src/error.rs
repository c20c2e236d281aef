use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("pdf extraction failed: {0}")]
    Extraction(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChatError {
    /// The question plus mandatory framing leaves no safe room in the model context.
    #[error("question is too long: {used} tokens used, hard limit is {limit}")]
    QuestionTooLarge { used: usize, limit: usize },
}
