use std::{fmt, io};

#[cfg(feature = "service")]
use std::{borrow::Cow, error::Error as StdError};

use http::status::StatusCode;
use regex::Error as RegexError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(feature = "service")]
use sqlx::{
    error::{DatabaseError, ErrorKind as DatabaseErrorKind},
    Error as SqlxError,
};

use serde_json::Error as JsonError;

use crate::conflict::ConflictList;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum SlugError {
    #[error("Slug collision: {0}")]
    Collision(ConflictList),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("File System error: {0}")]
    Io(String),
    #[error("Node could not be loaded: {0}")]
    Load(String),
    #[error("Item Not Found: {0}")]
    NotFound(String),
    #[error("This process already has a running generation queue entry")]
    QueueBusy,
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
    #[error("Slug store error: {0}")]
    Store(String),
    #[error("Template expansion error: {0}")]
    Template(String),
}

impl SlugError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SlugError::Collision(_) => StatusCode::CONFLICT,
            SlugError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SlugError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SlugError::Load(_) => StatusCode::NOT_FOUND,
            SlugError::NotFound(_) => StatusCode::NOT_FOUND,
            SlugError::QueueBusy => StatusCode::CONFLICT,
            SlugError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SlugError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SlugError::Template(_) => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }

    /// Load failures abort one branch of a build but are not retried.
    pub fn is_load(&self) -> bool {
        matches!(self, SlugError::Load(_))
    }
}

impl From<toml::de::Error> for SlugError {
    fn from(src: toml::de::Error) -> SlugError {
        SlugError::Serialization(format!("Toml deserialization error: {src}"))
    }
}

impl From<toml::ser::Error> for SlugError {
    fn from(src: toml::ser::Error) -> SlugError {
        SlugError::Serialization(format!("Toml serialization error: {src}"))
    }
}

impl From<JsonError> for SlugError {
    fn from(src: JsonError) -> SlugError {
        SlugError::Serialization(format!("JSON (de)serialization error: {src}"))
    }
}

impl From<uuid::Error> for SlugError {
    fn from(src: uuid::Error) -> SlugError {
        SlugError::Serialization(format!("UUID conversion failed: {src}"))
    }
}

impl From<hex::FromHexError> for SlugError {
    fn from(src: hex::FromHexError) -> SlugError {
        SlugError::Serialization(format!("Invalid payload digest: {src}"))
    }
}

impl From<io::Error> for SlugError {
    fn from(x: io::Error) -> Self {
        match x.kind() {
            io::ErrorKind::NotFound => SlugError::NotFound(format!("{x}")),
            _ => SlugError::Io(format!("IOError: {}", x.kind())),
        }
    }
}

impl From<fmt::Error> for SlugError {
    fn from(x: fmt::Error) -> Self {
        SlugError::Template(format!("{x}"))
    }
}

impl From<RegexError> for SlugError {
    fn from(x: RegexError) -> Self {
        SlugError::Template(format!("Regex parse failed: {x}"))
    }
}

impl From<ConflictList> for SlugError {
    fn from(conflicts: ConflictList) -> Self {
        SlugError::Collision(conflicts)
    }
}

#[cfg(feature = "service")]
impl From<SqlxError> for SlugError {
    fn from(db_error: SqlxError) -> Self {
        SlugError::Store(format!("database error: {db_error:?}"))
    }
}

#[cfg(feature = "service")]
impl DatabaseError for SlugError {
    fn message(&self) -> &str {
        "noet-slugs FromRow parsing failure"
    }

    fn kind(&self) -> sqlx::error::ErrorKind {
        DatabaseErrorKind::Other
    }

    /// The extended result code.
    #[inline]
    fn code(&self) -> Option<Cow<'_, str>> {
        None
    }

    #[doc(hidden)]
    fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self
    }

    #[doc(hidden)]
    fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
        self
    }

    #[doc(hidden)]
    fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
        self
    }
}
