use std::fmt;

/// A basic error type from this library.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Like a classic EAGAIN. The receiver should retry.
    Again,

    /// A generic error message.
    Msg(String),

    /// Allocation failure or a broken internal invariant.
    GeneralFailure(String),

    /// A decoded name is longer than the maximum name length.
    LabelTooLong,

    /// The input ran out before an expected field.
    BodyTooShort,

    /// Bytes remain after all declared sections were decoded.
    ExtraBody,

    /// A caller supplied name cannot be carried in a message.
    InvalidName(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Again => write!(f, "try again"),
            Self::Msg(s) => write!(f, "{}", s),
            Self::GeneralFailure(s) => write!(f, "general failure: {}", s),
            Self::LabelTooLong => write!(f, "label exceeds the maximum name length"),
            Self::BodyTooShort => write!(f, "message body is too short"),
            Self::ExtraBody => write!(f, "extra bytes after the last declared section"),
            Self::InvalidName(s) => write!(f, "invalid name: {}", s),
        }
    }
}

impl std::error::Error for Error {}

/// One and only `Result` type from this library crate.
pub type Result<T> = core::result::Result<T, Error>;

/// A simple macro to report all kinds of errors.
macro_rules! e_fmt {
  ($($arg:tt)+) => {
      $crate::error::Error::Msg(format!($($arg)+))
  };
}

pub(crate) use e_fmt;
