use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResonatorError {
    #[error("Input error: {0}")]
    Input(String),
    #[error("Shape error: {0}")]
    Shape(String),
    #[error("Triangulation error: {0}")]
    Triangulation(String),
    #[error("Material error: {0}")]
    Material(String),
    #[error("Solver error: {0}")]
    Solver(String),
    #[error("Dataset error: {0}")]
    Dataset(String),
    #[error("Post Processor error: {0}")]
    PostProcessor(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ResonatorError>;
