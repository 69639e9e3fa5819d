use std::fmt;

/// Failure classes surfaced by the pipeline. None of them are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unknown device/base/kernel combination, bad manifest or config. Raised before mutation.
    Configuration,
    /// Requested kernel version differs from the one found in the fetched source.
    VersionMismatch,
    /// Network, clone or archive extraction failure.
    ResourceAcquisition,
    /// Missing patch target, rejected patch or re-applied transformation.
    PatchApplication,
    /// Non-zero exit from the external build tool.
    Build,
    /// Staging the image or writing the flashable zip failed.
    Packaging,
    Other,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::VersionMismatch => "version-mismatch",
            ErrorKind::ResourceAcquisition => "resource-acquisition",
            ErrorKind::PatchApplication => "patch-application",
            ErrorKind::Build => "build",
            ErrorKind::Packaging => "packaging",
            ErrorKind::Other => "other",
        }
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Other, msg)
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Configuration, msg)
    }

    pub fn version_mismatch<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::VersionMismatch, msg)
    }

    pub fn resource<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::ResourceAcquisition, msg)
    }

    pub fn patch<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::PatchApplication, msg)
    }

    pub fn build<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Build, msg)
    }

    pub fn packaging<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Packaging, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.msg
    }

    /// Reclassify a plumbing failure (e.g. a failed subprocess) at the call site that knows what it meant.
    pub fn recast(self, kind: ErrorKind) -> Self {
        Self { kind, ..self }
    }

    /// Prefix the message, keeping the kind.
    pub fn context<M: fmt::Display>(self, prefix: M) -> Self {
        Self {
            kind: self.kind,
            msg: format!("{prefix}: {}", self.msg),
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
        Self::config(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::config(format!("invalid manifest: {err}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::resource(format!("download failed: {err}"))
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(err: zip::result::ZipError) -> Self {
        Self::msg(format!("zip error: {err}"))
    }
}

impl From<walkdir::Error> for Error {
    fn from(err: walkdir::Error) -> Self {
        Self::msg(format!("walkdir error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keeps_kind() {
        let err = Error::version_mismatch("4.9 != 4.4").context("task 'kernel.verify' failed");
        assert_eq!(err.kind(), ErrorKind::VersionMismatch);
        assert_eq!(err.to_string(), "task 'kernel.verify' failed: 4.9 != 4.4");
    }

    #[test]
    fn recast_changes_only_kind() {
        let err = Error::msg("command failed: exit status: 2").recast(ErrorKind::Build);
        assert_eq!(err.kind(), ErrorKind::Build);
        assert_eq!(err.message(), "command failed: exit status: 2");
    }
}
