//! Email address validation and canonical form.

use mailparse::{addrparse, MailAddr};

use crate::error::{Error, Result};

/// Parse a user-supplied address and return its canonical form.
///
/// The input must hold exactly one mailbox (a display name is allowed and
/// dropped). Surrounding whitespace is removed and the domain is lowercased;
/// the local part is kept as written since it may be case-sensitive.
pub fn normalize_email(input: &str) -> Result<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidEmail(input.to_string()));
    }

    let parsed = addrparse(trimmed).map_err(|_| Error::InvalidEmail(input.to_string()))?;
    let addr = match parsed.as_slice() {
        [MailAddr::Single(single)] => single.addr.trim(),
        _ => return Err(Error::InvalidEmail(input.to_string())),
    };

    let (local, domain) = addr
        .rsplit_once('@')
        .ok_or_else(|| Error::InvalidEmail(input.to_string()))?;

    if local.is_empty()
        || local.contains('@')
        || domain.is_empty()
        || domain.starts_with('.')
        || domain.ends_with('.')
        || domain.contains("..")
        || addr.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(Error::InvalidEmail(input.to_string()));
    }

    Ok(format!("{}@{}", local, domain.to_ascii_lowercase()))
}
