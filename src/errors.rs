// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Common `Error` and `Result` types used throughout the library and application. Serves as a reference for all that can go wrong.
use crate::capture::CaptureError;
use crate::config::ConfigError;
use crate::constants::{EXIT_BAD_TARGET, EXIT_RUNTIME, EXIT_TRANSPORT_SETUP, EXIT_USAGE};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] ConfigError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("malformed URL: {0}")]
    URLParseError(#[from] url::ParseError),

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("tls setup error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("capture source error: {0}")]
    Capture(#[from] CaptureError),

    #[error("failed to write replay output: {0}")]
    Emission(#[source] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Process exit status for an error that reaches `main`.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ConfigFileError(_) | Error::Config(_) => EXIT_USAGE,
            Error::URLParseError(_) | Error::InvalidTarget(_) => EXIT_BAD_TARGET,
            Error::Tls(_) => EXIT_TRANSPORT_SETUP,
            _ => EXIT_RUNTIME,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_distinguish_fatal_errors() {
        assert_eq!(Error::Config("bad".into()).exit_code(), 2);
        assert_eq!(Error::InvalidTarget("no port".into()).exit_code(), 3);
        let parse_err = url::Url::parse("::not a url").unwrap_err();
        assert_eq!(Error::from(parse_err).exit_code(), 3);
        assert_eq!(Error::Tls(rustls::Error::General("x".into())).exit_code(), 4);
        let io = std::io::Error::other("disk full");
        assert_eq!(Error::Emission(io).exit_code(), 5);
        assert_eq!(Error::Internal("leftover".into()).exit_code(), 5);
    }
}
