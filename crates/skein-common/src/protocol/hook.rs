//! Response destinations.
//!
//! Hooks travel as plain strings in the envelope and are parsed by whoever
//! has to deliver to them.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::error::{Result, SkeinError};

const UNIX_SCHEME: &str = "unix://";

/// A parsed response destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hook {
    /// Framed JSON over a local Unix socket
    Unix(PathBuf),
    /// JSON POST to an HTTP(S) URL
    Http(String),
}

impl Hook {
    pub fn parse(raw: &str) -> Result<Self> {
        if let Some(path) = raw.strip_prefix(UNIX_SCHEME) {
            let path = Path::new(path);
            if !path.is_absolute() {
                return Err(SkeinError::InvalidHook(raw.to_string()));
            }
            return Ok(Hook::Unix(path.to_path_buf()));
        }

        if raw.starts_with("http://") || raw.starts_with("https://") {
            return Ok(Hook::Http(raw.to_string()));
        }

        Err(SkeinError::InvalidHook(raw.to_string()))
    }

    /// Formats a socket path as a `unix://` hook string.
    pub fn unix_url(path: &Path) -> String {
        format!("{}{}", UNIX_SCHEME, path.display())
    }

    pub fn is_unix(raw: &str) -> bool {
        raw.starts_with(UNIX_SCHEME)
    }
}

impl FromStr for Hook {
    type Err = SkeinError;

    fn from_str(s: &str) -> Result<Self> {
        Hook::parse(s)
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hook::Unix(path) => write!(f, "{}{}", UNIX_SCHEME, path.display()),
            Hook::Http(url) => f.write_str(url),
        }
    }
}
