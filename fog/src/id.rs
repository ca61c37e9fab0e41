//! Machine identity generation.

use rand::TryRngCore;
use rand::rngs::OsRng;

/// Number of random bytes in a machine identifier.
pub const ID_BYTES: usize = 32;

/// Generates a random machine identifier.
///
/// The identifier is 32 bytes from the operating system's CSPRNG, encoded
/// as 64 lowercase hex characters. Uniqueness is probabilistic; nothing
/// checks new identifiers against existing ones.
///
/// # Panics
///
/// Panics if the OS entropy source fails. A host that cannot produce
/// randomness cannot hand out safe identities.
#[allow(clippy::panic)]
pub fn generate_id() -> String {
    let mut bytes = [0u8; ID_BYTES];
    if let Err(e) = OsRng.try_fill_bytes(&mut bytes) {
        panic!("reading OS entropy for machine id: {e}");
    }
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn id_is_lowercase_hex() {
        let id = generate_id();
        assert_eq!(id.len(), ID_BYTES * 2);
        assert!(id.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')));
    }

    #[test]
    fn ids_do_not_repeat() {
        let ids: HashSet<String> = (0..2048).map(|_| generate_id()).collect();
        assert_eq!(ids.len(), 2048);
    }
}
