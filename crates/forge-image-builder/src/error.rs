use std::fmt;
use std::path::PathBuf;

use crate::stage::Stage;

#[derive(Debug)]
pub enum Error {
    Msg(String),
    /// A recipe returned failure for a stage.
    Recipe {
        location: PathBuf,
        stage: Stage,
        source: Box<Error>,
    },
    /// Image creation, formatting, directory creation or file copy failed.
    ImageIo { path: PathBuf, message: String },
    /// An external tool (vendored build, virtual machine) failed.
    Tool { tool: String, message: String },
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::Msg(msg.into())
    }

    pub fn recipe(location: impl Into<PathBuf>, stage: Stage, source: Error) -> Self {
        Self::Recipe {
            location: location.into(),
            stage,
            source: Box::new(source),
        }
    }

    pub fn image_io(path: impl Into<PathBuf>, message: impl fmt::Display) -> Self {
        Self::ImageIo {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn tool(tool: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.to_string(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Msg(msg) => write!(f, "{msg}"),
            Error::Recipe {
                location,
                stage,
                source,
            } => write!(
                f,
                "stage '{stage}' failed at {}: {source}",
                location.display()
            ),
            Error::ImageIo { path, message } => {
                write!(f, "image I/O failed at {}: {message}", path.display())
            }
            Error::Tool { tool, message } => write!(f, "{tool} failed: {message}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Recipe { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::msg(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
