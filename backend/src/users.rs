use crate::errors::{Error, Result};
use crate::model::{Identity, Role};
use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};

/// Pluggable identity lookup, so a real directory or user store can be
/// substituted without touching token or authorization logic.
pub trait IdentityProvider: Send + Sync {
    fn authenticate(&self, username: &str, password: &str) -> Result<Identity>;
}

struct UserEntry {
    username: String,
    password_hash: String,
    role: Role,
}

/// Fixed in-memory operator table. Passwords are stored as salted argon2
/// hashes, never as plaintext.
pub struct StaticUsers {
    users: Vec<UserEntry>,
    // Verified against on unknown-username lookups so both miss paths cost
    // one argon2 verify and response timing does not enumerate usernames.
    dummy_hash: String,
}

impl StaticUsers {
    pub fn new() -> Self {
        let salt = SaltString::generate(&mut OsRng);
        let dummy_hash = Argon2::default()
            .hash_password(b"unimount-decoy-password", &salt)
            .expect("argon2 hashing with default params cannot fail")
            .to_string();

        StaticUsers {
            users: Vec::new(),
            dummy_hash,
        }
    }

    /// The stock table: admin/admin and user/user. Placeholder accounts until
    /// a real user directory is wired in.
    pub fn with_defaults() -> Self {
        let mut users = Self::new();
        users.add("admin", "admin", Role::Admin);
        users.add("user", "user", Role::User);
        users
    }

    pub fn add(&mut self, username: &str, password: &str, role: Role) {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .expect("argon2 hashing with default params cannot fail")
            .to_string();

        self.users.push(UserEntry {
            username: username.to_string(),
            password_hash: hash,
            role,
        });
    }
}

impl IdentityProvider for StaticUsers {
    fn authenticate(&self, username: &str, password: &str) -> Result<Identity> {
        let Some(entry) = self.users.iter().find(|u| u.username == username) else {
            if let Ok(parsed) = PasswordHash::new(&self.dummy_hash) {
                let _ = Argon2::default().verify_password(password.as_bytes(), &parsed);
            }
            return Err(Error::InvalidCredentials);
        };

        let parsed = PasswordHash::new(&entry.password_hash)
            .map_err(|_| Error::InvalidCredentials)?;

        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .map_err(|_| Error::InvalidCredentials)?;

        Ok(Identity {
            subject: entry.username.clone(),
            role: entry.role,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_admin_login() {
        let users = StaticUsers::with_defaults();
        let identity = users.authenticate("admin", "admin").unwrap();
        assert_eq!(identity.subject, "admin");
        assert_eq!(identity.role, Role::Admin);
    }

    #[test]
    fn test_default_user_login() {
        let users = StaticUsers::with_defaults();
        let identity = users.authenticate("user", "user").unwrap();
        assert_eq!(identity.role, Role::User);
    }

    #[test]
    fn test_wrong_password_rejected() {
        let users = StaticUsers::with_defaults();
        let err = users.authenticate("admin", "hunter2").unwrap_err();
        assert!(matches!(err, Error::InvalidCredentials));
    }

    #[test]
    fn test_unknown_user_rejected() {
        let users = StaticUsers::with_defaults();
        let err = users.authenticate("nobody", "nobody").unwrap_err();
        assert!(matches!(err, Error::InvalidCredentials));
    }

    #[test]
    fn test_unknown_user_rejected_even_with_decoy_password() {
        let users = StaticUsers::with_defaults();
        let err = users
            .authenticate("ghost", "unimount-decoy-password")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCredentials));
    }

    #[test]
    fn test_cross_account_password_rejected() {
        let users = StaticUsers::with_defaults();
        let err = users.authenticate("admin", "user").unwrap_err();
        assert!(matches!(err, Error::InvalidCredentials));
    }
}
