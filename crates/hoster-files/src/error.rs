use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Access denied. Path escapes the workspace root.")]
    PathEscapesRoot,

    #[error("Invalid filename: {0}")]
    InvalidFileName(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Refusing to replace directory with file: {0}")]
    IsADirectory(String),

    #[error("File too large: {size} bytes exceeds limit of {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkspaceError {
    /// Stable machine-readable code for the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            WorkspaceError::NotFound(_) => "NOT_FOUND",
            WorkspaceError::PathEscapesRoot => "PATH_ESCAPES_ROOT",
            WorkspaceError::InvalidFileName(_) => "INVALID_FILE_NAME",
            WorkspaceError::NotADirectory(_) => "NOT_A_DIRECTORY",
            WorkspaceError::IsADirectory(_) => "IS_A_DIRECTORY",
            WorkspaceError::FileTooLarge { .. } => "FILE_TOO_LARGE",
            WorkspaceError::Io(_) => "IO_FAILURE",
        }
    }
}
