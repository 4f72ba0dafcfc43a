use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use sha2::{Digest, Sha256};

/// RFC 7636 `unreserved` characters.
const UNRESERVED: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

pub const VERIFIER_LEN: usize = 128;
pub const STATE_LEN: usize = 32;

/// How long a pending login attempt stays usable.
pub const ATTEMPT_TTL: Duration = Duration::from_secs(10 * 60);

/// PKCE verifier, challenge and CSRF state for a single login attempt.
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    verifier: String,
    challenge: String,
    state: String,
}

impl PkceChallenge {
    /// Create a fresh random verifier/challenge/state triple.
    pub fn generate() -> Self {
        let verifier = generate_verifier();
        let challenge = derive_challenge(&verifier);
        Self {
            verifier,
            challenge,
            state: generate_state(),
        }
    }

    pub fn verifier(&self) -> &str {
        &self.verifier
    }

    pub fn challenge(&self) -> &str {
        &self.challenge
    }

    pub fn state(&self) -> &str {
        &self.state
    }
}

/// High-entropy code verifier drawn from the unreserved character set.
pub fn generate_verifier() -> String {
    random_unreserved(VERIFIER_LEN)
}

/// S256 code challenge: base64url(SHA-256(verifier)) without padding.
pub fn derive_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Random nonce used as the OAuth `state` parameter.
pub fn generate_state() -> String {
    random_unreserved(STATE_LEN)
}

fn random_unreserved(len: usize) -> String {
    // thread_rng is a CSPRNG seeded from the OS; it panics if the OS source is unavailable.
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| UNRESERVED[rng.gen_range(0..UNRESERVED.len())] as char)
        .collect()
}

/// Short-lived holder for the PKCE pair of the login attempt in progress.
///
/// At most one attempt is pending; beginning a new login replaces the previous one.
#[derive(Debug, Default)]
pub struct PkceStore {
    pending: Mutex<Option<(PkceChallenge, Instant)>>,
}

impl PkceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save(&self, challenge: PkceChallenge) {
        *self.lock() = Some((challenge, Instant::now()));
    }

    /// Stored state of the pending attempt, if it has not expired.
    pub fn state(&self) -> Option<String> {
        self.live().map(|challenge| challenge.state)
    }

    /// Verifier of the pending attempt, if it has not expired.
    pub fn verifier(&self) -> Option<String> {
        self.live().map(|challenge| challenge.verifier)
    }

    pub fn clear(&self) {
        self.lock().take();
    }

    fn live(&self) -> Option<PkceChallenge> {
        let mut guard = self.lock();
        match guard.as_ref() {
            Some((_, created)) if created.elapsed() > ATTEMPT_TTL => {
                guard.take();
                None
            }
            Some((challenge, _)) => Some(challenge.clone()),
            None => None,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<(PkceChallenge, Instant)>> {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
