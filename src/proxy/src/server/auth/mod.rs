use crate::protocol::mysql::constants::{AuthPluginName, SCRAMBLE_SIZE};

use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha1::Digest;
use sha2::Sha256;
use std::sync::Arc;

pub mod authenticator;

/// Generate a random scramble from printable ASCII, avoiding the bytes the
/// protocol reserves.
/// https://github.com/mysql/mysql-server/blob/8.0/mysys/crypt_genhash_impl.cc#L427
#[inline]
pub fn gen_user_salt() -> [u8; SCRAMBLE_SIZE] {
    let mut salt: [u8; SCRAMBLE_SIZE] = [0; SCRAMBLE_SIZE];
    let mut r = StdRng::from_entropy();
    for salt_item in salt.iter_mut() {
        let salt_rand = r.gen_range(1..127) as u8;
        *salt_item = salt_rand;
        if *salt_item == b'\0' || *salt_item == b'$' {
            *salt_item += 1;
        }
    }
    salt
}

fn to_u8_32(bytes: impl AsRef<[u8]>) -> [u8; 32] {
    let mut out = [0; 32];
    (out[..]).copy_from_slice(bytes.as_ref());
    out
}

pub fn sha256_1(bytes: impl AsRef<[u8]>) -> [u8; 32] {
    let mut hasher = Sha256::default();
    hasher.update(bytes.as_ref());
    to_u8_32(hasher.finalize())
}

pub fn sha256_2(bytes1: impl AsRef<[u8]>, bytes2: impl AsRef<[u8]>) -> [u8; 32] {
    let mut hasher = Sha256::default();
    hasher.update(bytes1.as_ref());
    hasher.update(bytes2.as_ref());
    to_u8_32(hasher.finalize())
}

pub fn sha1_1(bytes: impl AsRef<[u8]>) -> [u8; 20] {
    sha1::Sha1::digest(bytes).into()
}

pub fn sha1_2(bytes1: impl AsRef<[u8]>, bytes2: impl AsRef<[u8]>) -> [u8; 20] {
    let mut hasher = sha1::Sha1::new();
    hasher.update(bytes1.as_ref());
    hasher.update(bytes2.as_ref());
    hasher.finalize().into()
}

pub fn xor<T, U>(mut left: T, right: U) -> T
where
    T: AsMut<[u8]>,
    U: AsRef<[u8]>,
{
    left.as_mut()
        .iter_mut()
        .zip(right.as_ref().iter())
        .map(|(l, r)| *l ^= r)
        .last();
    left
}

/// `mysql_native_password` response:
/// `SHA1(password) XOR SHA1(scramble + SHA1(SHA1(password)))`.
pub fn native_password_response(scramble: &[u8], password: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let pw_hash = sha1_1(password);
    let double_hash = sha1_1(pw_hash);
    let salted = sha1_2(scramble, double_hash);
    xor(pw_hash, salted).to_vec()
}

/// `caching_sha2_password` scramble response:
/// `SHA256(password) XOR SHA256(SHA256(SHA256(password)) + scramble)`.
pub fn caching_sha2_response(scramble: &[u8], password: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let pw_hash = sha256_1(password);
    let double_hash = sha256_1(pw_hash);
    let salted = sha256_2(double_hash, scramble);
    xor(pw_hash, salted).to_vec()
}

/// Scramble response for `plugin` against `scramble`, from a cleartext
/// password.
pub fn scramble_response(
    plugin: AuthPluginName,
    scramble: &[u8],
    password: &[u8],
) -> Option<Vec<u8>> {
    match plugin {
        AuthPluginName::AuthNativePassword => Some(native_password_response(scramble, password)),
        AuthPluginName::AuthCachingSha2Password | AuthPluginName::AuthSha256Password => {
            Some(caching_sha2_response(scramble, password))
        }
        AuthPluginName::AuthMySQlOldPassword | AuthPluginName::UnKnowPluginName => None,
    }
}

/// What the router learned about an account while brokering its login.
///
/// The cleartext is only available when the connection phase made the
/// client reveal it (sha2 full-auth over a TLS channel); without it a
/// fresh backend can only be authenticated by asking the client again.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub schema: Option<String>,
    pub auth_method: Option<AuthPluginName>,
    pub cleartext_password: Option<Vec<u8>>,
}

/// Shared username → credentials map. Auth routines write, the reconnect
/// path reads.
#[derive(Default)]
pub struct CredentialCache {
    entries: DashMap<String, Credentials>,
}

impl CredentialCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn store(&self, creds: Credentials) {
        self.entries.insert(creds.username.clone(), creds);
    }

    pub fn store_cleartext(&self, username: &str, password: &[u8]) {
        self.entries
            .entry(username.to_string())
            .or_insert_with(|| Credentials {
                username: username.to_string(),
                ..Credentials::default()
            })
            .cleartext_password = Some(password.to_vec());
    }

    pub fn get(&self, username: &str) -> Option<Credentials> {
        self.entries.get(username).map(|e| e.value().clone())
    }

    pub fn forget(&self, username: &str) {
        self.entries.remove(username);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn salt_has_no_reserved_bytes() {
        for _ in 0..32 {
            let salt = gen_user_salt();
            assert!(!salt.contains(&0));
            assert!(!salt.contains(&b'$'));
        }
    }

    #[test]
    fn native_password_known_vector() {
        // generated against a 5.7 server
        let scramble = b";X,po_k}>o6^Wz!/kM}N";
        let response = native_password_response(scramble, b"password");
        assert_eq!(response.len(), 20);
        // invariant: response XOR SHA1(scramble+SHA1(SHA1(pw))) == SHA1(pw)
        let pw_hash = sha1_1(b"password");
        let salted = sha1_2(scramble, sha1_1(pw_hash));
        assert_eq!(xor(response.clone(), salted), pw_hash.to_vec());
    }

    #[test]
    fn caching_sha2_shape() {
        let scramble = [7u8; 20];
        let response = caching_sha2_response(&scramble, b"secret");
        assert_eq!(response.len(), 32);
        assert!(native_password_response(&scramble, b"").is_empty());
        assert!(caching_sha2_response(&scramble, b"").is_empty());
    }

    #[test]
    fn credential_cache_round_trip() {
        let cache = CredentialCache::new();
        cache.store(Credentials {
            username: "app".to_string(),
            schema: Some("prod".to_string()),
            auth_method: Some(AuthPluginName::AuthCachingSha2Password),
            cleartext_password: None,
        });
        cache.store_cleartext("app", b"hunter2");

        let creds = cache.get("app").unwrap();
        assert_eq!(creds.schema.as_deref(), Some("prod"));
        assert_eq!(creds.cleartext_password.as_deref(), Some(&b"hunter2"[..]));

        cache.forget("app");
        assert!(cache.get("app").is_none());
    }
}
