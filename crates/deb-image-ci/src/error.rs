use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Other,
    /// Host is missing qemu, qemu-img or UEFI firmware.
    MissingDependency,
    SnapshotCreation,
    ExpectTimeout,
    /// The console stream hit EOF before an expected pattern showed up.
    ConsoleClosed,
    NestedTestsFailed,
    /// SIGINT/SIGTERM arrived while the session was running.
    Interrupted,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Other, msg)
    }

    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn missing_dependency<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::MissingDependency, msg)
    }

    pub fn snapshot_creation<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::SnapshotCreation, msg)
    }

    pub fn expect_timeout<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::ExpectTimeout, msg)
    }

    pub fn console_closed<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::ConsoleClosed, msg)
    }

    pub fn nested_tests_failed<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::NestedTestsFailed, msg)
    }

    pub fn interrupted<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Interrupted, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    // Prefix with the phase name; the kind is preserved so callers can still branch on it.
    pub fn context(self, phase: &str) -> Self {
        Self {
            kind: self.kind,
            msg: format!("{phase}: {}", self.msg),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

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

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::msg(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keeps_kind_and_prefixes_phase() {
        let err = Error::expect_timeout("no 'login:' within 240s").context("login");
        assert_eq!(err.kind(), ErrorKind::ExpectTimeout);
        assert_eq!(err.to_string(), "login: no 'login:' within 240s");
    }
}
