//! Errors surfaced by the benchmark driver and the store adapters.
//!
//! Every variant names the stage that failed, so a report can tell a store that could not be
//! brought up apart from one that misbehaved under load. Lookups that miss are never errors: they
//! show up in the found/deleted counters instead.

use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The benchmark or store configuration cannot produce a valid run (zero threads, unknown
    /// operation, unparsable TOML, ...). Detected before any worker is spawned.
    Config(String),

    /// The store could not be provisioned or prefilled.
    Setup(String),

    /// The store failed while worker threads were running operations.
    Run(String),

    /// The store could not release the resources of a run.
    Teardown(String),

    /// Results could not be written out.
    Output(String),
}

impl Error {
    /// The lifecycle stage the error is attributed to.
    pub fn stage(&self) -> &'static str {
        match self {
            Error::Config(_) => "configuration",
            Error::Setup(_) => "setup",
            Error::Run(_) => "run",
            Error::Teardown(_) => "teardown",
            Error::Output(_) => "output",
        }
    }

    /// Re-attribute an error raised by a range operation to setup. Used while prefilling, where
    /// the same insert path runs before any timed operation.
    pub(crate) fn into_setup(self) -> Self {
        match self {
            Error::Run(msg) => Error::Setup(format!("prefill: {}", msg)),
            e => e,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "invalid configuration: {}", msg),
            Error::Setup(msg) => write!(f, "setup failed: {}", msg),
            Error::Run(msg) => write!(f, "run failed: {}", msg),
            Error::Teardown(msg) => write!(f, "teardown failed: {}", msg),
            Error::Output(msg) => write!(f, "cannot write results: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<figment::Error> for Error {
    fn from(e: figment::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
