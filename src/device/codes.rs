use base64ct::Encoding;
use rand::{Rng, RngCore};

/// Consonants only: no vowels (no accidental words), no 0/O or 1/I/L lookalikes
/// that survive uppercasing.
pub const USER_CODE_ALPHABET: &[u8] = b"BCDFGHJKLMNPQRSTVWXZ";

/// Characters per user_code group; codes are two groups joined by `-`.
pub const USER_CODE_GROUP_LEN: usize = 4;

const USER_CODE_LEN: usize = USER_CODE_GROUP_LEN * 2;

/// 32 random bytes = 256 bits of device_code entropy.
const DEVICE_CODE_BYTES: usize = 32;

/// Produces the two credentials of a device authorization.
///
/// Uniqueness is not this trait's job: the store rejects duplicates on insert
/// and the caller asks for a fresh pair.
pub trait CodeGenerator: Send + Sync {
    fn device_code(&self) -> String;
    fn user_code(&self) -> String;
}

/// `device_code`: base64url of 32 bytes from the thread-local CSPRNG.
/// `user_code`: 8 characters from [`USER_CODE_ALPHABET`] formatted XXXX-XXXX
/// (20^8 = ~43 bits).
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomCodeGenerator;

impl CodeGenerator for RandomCodeGenerator {
    fn device_code(&self) -> String {
        let mut bytes = [0u8; DEVICE_CODE_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        base64ct::Base64UrlUnpadded::encode_string(&bytes)
    }

    fn user_code(&self) -> String {
        let mut rng = rand::thread_rng();
        let mut code = String::with_capacity(USER_CODE_LEN + 1);

        for i in 0..USER_CODE_LEN {
            if i == USER_CODE_GROUP_LEN {
                code.push('-');
            }
            let idx = rng.gen_range(0..USER_CODE_ALPHABET.len());
            code.push(USER_CODE_ALPHABET[idx] as char);
        }

        code
    }
}

/// Canonicalise user input to `XXXX-XXXX`.
///
/// Case-insensitive; whitespace and dashes anywhere are ignored, so
/// `wdjb mjht`, `WDJB-MJHT` and `wdjbmjht` are the same code. Returns `None`
/// when the input cannot be a user_code at all (wrong length or characters
/// other than ASCII letters and digits). Only the shape is checked, not the
/// generation alphabet.
pub fn normalize_user_code(input: &str) -> Option<String> {
    let mut chars = String::with_capacity(USER_CODE_LEN);
    for c in input.chars() {
        if c.is_whitespace() || c == '-' {
            continue;
        }
        if !c.is_ascii_alphanumeric() {
            return None;
        }
        chars.push(c.to_ascii_uppercase());
    }

    if chars.len() != USER_CODE_LEN {
        return None;
    }

    let (first, second) = chars.split_at(USER_CODE_GROUP_LEN);
    Some(format!("{first}-{second}"))
}

/// Join the two halves typed into the segmented entry form.
pub fn join_user_code_parts(part1: &str, part2: &str) -> String {
    format!("{}-{}", part1.trim(), part2.trim())
}
