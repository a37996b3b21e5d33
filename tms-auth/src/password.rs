// Password hashing.
//
// bcrypt is CPU bound; async callers should run these on a blocking thread.

use anyhow::Result;
use bcrypt::{hash, verify};
use tms_core::errors::TmsError;

use crate::options::PasswordOptions;

pub fn hash_password(password: &str, options: &PasswordOptions) -> Result<String> {
    if password.is_empty() {
        return Err(TmsError::bad_request("Password cannot be empty").into_anyhow());
    }

    hash(password, options.cost)
        .map_err(|e| TmsError::general_error(format!("Password hashing failed: {e}")).into_anyhow())
}

/// `Ok(false)` for a wrong password; `Err` only when the stored hash is unreadable.
pub fn verify_password(password: &str, password_hash: &str) -> Result<bool> {
    verify(password, password_hash)
        .map_err(|e| TmsError::general_error(format!("Stored password hash is invalid: {e}")).into_anyhow())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> PasswordOptions {
        PasswordOptions { cost: 4 }
    }

    #[test]
    fn hash_then_verify() {
        let stored = hash_password("correct horse", &fast()).unwrap();
        assert_ne!(stored, "correct horse");
        assert!(verify_password("correct horse", &stored).unwrap());
        assert!(!verify_password("battery staple", &stored).unwrap());
    }

    #[test]
    fn empty_password_is_a_bad_request() {
        let err = hash_password("", &fast()).unwrap_err();
        assert_eq!(TmsError::from_anyhow(&err).map(|e| e.code()), Some(400));
    }

    #[test]
    fn garbage_hash_is_an_error() {
        assert!(verify_password("x", "not-a-bcrypt-hash").is_err());
    }
}
