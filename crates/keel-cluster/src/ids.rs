//! Identifier and secret token generation
//!
//! Credential derivation takes an injected [`IdGenerator`] so tests can
//! supply fixed or colliding values.

use rand::rngs::OsRng;
use rand::RngCore;
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use keel_common::Error;

/// Alphabet of bootstrap token characters
const TOKEN_CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Length of the public token id
const TOKEN_ID_LEN: usize = 6;

/// Length of the private token secret
const TOKEN_SECRET_LEN: usize = 16;

/// Bytes of randomness in a certificate key
pub const CERTIFICATE_KEY_BYTES: usize = 32;

/// Source of cluster tokens, bootstrap tokens and certificate keys
#[cfg_attr(test, automock)]
pub trait IdGenerator: Send + Sync {
    /// Globally unique, time sortable cluster token
    fn cluster_token(&self) -> Result<String, Error>;

    /// Node-join bootstrap token in `[a-z0-9]{6}.[a-z0-9]{16}` form
    fn bootstrap_token(&self) -> Result<String, Error>;

    /// Hex encoded 32-byte certificate key
    fn certificate_key(&self) -> Result<String, Error>;
}

/// Generator backed by UUID v7 and the operating system's random source
#[derive(Clone, Copy, Debug, Default)]
pub struct SecureIdGenerator;

impl IdGenerator for SecureIdGenerator {
    fn cluster_token(&self) -> Result<String, Error> {
        Ok(Uuid::now_v7().to_string())
    }

    fn bootstrap_token(&self) -> Result<String, Error> {
        let id = random_token_chars(TOKEN_ID_LEN)?;
        let secret = random_token_chars(TOKEN_SECRET_LEN)?;
        Ok(format!("{}.{}", id, secret))
    }

    fn certificate_key(&self) -> Result<String, Error> {
        let mut bytes = [0u8; CERTIFICATE_KEY_BYTES];
        fill_random(&mut bytes)?;
        Ok(hex::encode(bytes))
    }
}

fn fill_random(buf: &mut [u8]) -> Result<(), Error> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|e| Error::crypto(format!("random source unavailable: {}", e)))
}

/// Draw `len` characters uniformly from [`TOKEN_CHARS`]
///
/// Bytes at or above the largest multiple of the alphabet size are rejected
/// so every character is equally likely.
fn random_token_chars(len: usize) -> Result<String, Error> {
    let limit = (256 / TOKEN_CHARS.len() * TOKEN_CHARS.len()) as u8;
    let mut out = String::with_capacity(len);
    let mut buf = [0u8; 32];

    while out.len() < len {
        fill_random(&mut buf)?;
        for b in buf.iter().copied().filter(|b| *b < limit) {
            if out.len() == len {
                break;
            }
            out.push(TOKEN_CHARS[usize::from(b) % TOKEN_CHARS.len()] as char);
        }
    }
    Ok(out)
}

/// Check that a string has bootstrap token shape
pub fn is_bootstrap_token(token: &str) -> bool {
    let valid = |part: &str, len: usize| {
        part.len() == len && part.bytes().all(|b| TOKEN_CHARS.contains(&b))
    };
    match token.split_once('.') {
        Some((id, secret)) => valid(id, TOKEN_ID_LEN) && valid(secret, TOKEN_SECRET_LEN),
        None => false,
    }
}
