use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::config::truncate_to_slot;

pub const USER_CAP: usize = 32;
pub const SALT_LEN: usize = 16;
pub const DIGEST_LEN: usize = 32;

/// Web UI login. Only the salted digest is kept; the plaintext password
/// never reaches the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub user: String,
    salt: [u8; SALT_LEN],
    digest: [u8; DIGEST_LEN],
}

impl Default for Credential {
    fn default() -> Self {
        Self {
            user: "admin".to_string(),
            salt: [0; SALT_LEN],
            digest: [0; DIGEST_LEN],
        }
    }
}

impl Credential {
    pub fn from_parts(user: String, salt: [u8; SALT_LEN], digest: [u8; DIGEST_LEN]) -> Self {
        Self { user, salt, digest }
    }

    pub fn salt(&self) -> &[u8; SALT_LEN] {
        &self.salt
    }

    pub fn digest(&self) -> &[u8; DIGEST_LEN] {
        &self.digest
    }

    /// An all-zero salt means no password is set and requests are not
    /// challenged.
    pub fn is_protected(&self) -> bool {
        self.salt.iter().any(|byte| *byte != 0)
    }

    /// Draws a fresh salt and stores `SHA-256(salt ‖ password)`. An empty
    /// password clears both, disabling authentication.
    pub fn set_password<R: RngCore + ?Sized>(&mut self, password: &str, rng: &mut R) {
        self.salt = [0; SALT_LEN];
        self.digest = [0; DIGEST_LEN];
        if password.is_empty() {
            return;
        }

        rng.fill_bytes(&mut self.salt);
        if !self.is_protected() {
            self.salt[0] = 1;
        }
        self.digest = salted_digest(&self.salt, password.as_bytes());
    }

    /// Checks `user` and `password` against the stored digest. The password
    /// buffer is zeroed before returning, whatever the outcome.
    pub fn verify(&self, user: &[u8], password: &mut [u8]) -> bool {
        let computed = salted_digest(&self.salt, password);
        password.fill(0);

        let user_matches = user == self.user.as_bytes();
        user_matches && constant_time_eq(&computed, &self.digest)
    }

    pub(crate) fn sanitize(&mut self) {
        truncate_to_slot(&mut self.user, USER_CAP);
    }
}

fn salted_digest(salt: &[u8], password: &[u8]) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password);
    hasher.finalize().into()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0_u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    #[test]
    fn verifies_matching_password_and_clears_buffer() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut credential = Credential::default();
        credential.set_password("correctpass", &mut rng);

        let mut attempt = *b"correctpass";
        assert!(credential.verify(b"admin", &mut attempt));
        assert_eq!(attempt, [0; 11]);
    }

    #[test]
    fn rejects_wrong_password_or_user() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut credential = Credential::default();
        credential.set_password("correctpass", &mut rng);

        let mut wrong = *b"wrongpass";
        assert!(!credential.verify(b"admin", &mut wrong));
        assert_eq!(wrong, [0; 9]);

        let mut right = *b"correctpass";
        assert!(!credential.verify(b"root", &mut right));
    }

    #[test]
    fn empty_password_disables_protection() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut credential = Credential::default();
        credential.set_password("secret", &mut rng);
        assert!(credential.is_protected());

        credential.set_password("", &mut rng);
        assert!(!credential.is_protected());
        assert_eq!(credential.digest(), &[0; DIGEST_LEN]);
    }

    #[test]
    fn same_password_gets_a_new_salt() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut first = Credential::default();
        first.set_password("pw", &mut rng);
        let mut second = Credential::default();
        second.set_password("pw", &mut rng);

        assert_ne!(first.salt(), second.salt());
        assert_ne!(first.digest(), second.digest());
    }
}
