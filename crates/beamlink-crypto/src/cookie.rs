//! Cookie -- the shared secret both ends prove knowledge of.
//!
//! `Debug` and `Display` never show the value.

use std::fmt;
use std::path::Path;

use rand::Rng;

use crate::CryptoError;

/// Length of a generated cookie.
const GENERATED_LEN: usize = 20;

#[derive(Clone, PartialEq, Eq)]
pub struct Cookie(String);

impl Cookie {
    /// Wrap a cookie value. Rejects control characters and non-ASCII.
    pub fn new(value: impl Into<String>) -> Result<Self, CryptoError> {
        let value = value.into();
        if !value.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(CryptoError::InvalidCookie);
        }
        Ok(Cookie(value))
    }

    /// Random cookie in the same alphabet the runtime uses (upper case A-Z).
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let value = (0..GENERATED_LEN)
            .map(|_| rng.gen_range(b'A'..=b'Z') as char)
            .collect();
        Cookie(value)
    }

    /// Read a cookie file; surrounding whitespace is ignored.
    pub fn from_file(path: &Path) -> Result<Self, CryptoError> {
        let raw = std::fs::read_to_string(path)?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CryptoError::EmptyCookie {
                path: path.display().to_string(),
            });
        }
        Self::new(trimmed)
    }

    /// Load the cookie file, creating it (owner read-only) if absent.
    pub fn load_or_create(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            return Self::from_file(path);
        }
        let cookie = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, &cookie.0)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o400))?;
        }
        Ok(cookie)
    }

    /// Raw value, for the digest only.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Cookie(<redacted>)")
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}
