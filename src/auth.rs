//! Challenge-response login digest

use md5::{Digest, Md5};

/// Key for an MD5 `Login`: lower-case hex of `MD5(challenge || secret)`.
pub fn challenge_digest(challenge: &str, secret: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(challenge.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}
