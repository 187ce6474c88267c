//! SCRAM-SHA-256 authentication implementation.
//!
//! Implements RFC 5802 (SCRAM) and RFC 7677 (SCRAM-SHA-256) for PostgreSQL,
//! without channel binding. The exchange is:
//!
//! 1. [`ScramClient::compose_challenge`] → client-first-message
//! 2. [`ScramClient::receive_challenge`] ← server-first-message
//! 3. [`ScramClient::compose_response`] → client-final-message (with proof)
//! 4. [`ScramClient::receive_response`] ← server-final-message (server signature)
//!
//! Step 4 authenticates the server to the client and must never be skipped.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// GS2 header for "no channel binding, no authzid".
const GS2_HEADER: &str = "n,,";
/// base64(GS2_HEADER), the channel-binding attribute of the final message.
const CHANNEL_BINDING: &str = "biws";

/// SCRAM-SHA-256 client state machine.
pub struct ScramClient {
    /// Username
    username: String,
    /// Password
    password: String,
    /// Client nonce
    client_nonce: String,
    /// Combined nonce (client + server) from server-first-message
    combined_nonce: Option<String>,
    /// Verbatim server-first-message
    server_first: Option<String>,
    /// Server salt
    salt: Option<Vec<u8>>,
    /// Iteration count
    iterations: Option<u32>,
    /// Salted password (cached for final step)
    salted_password: Option<[u8; 32]>,
    /// Auth message for final verification
    auth_message: Option<String>,
}

impl ScramClient {
    /// Create a new SCRAM client with a random nonce.
    pub fn new(username: &str, password: &str) -> Self {
        // Generate 18 bytes of random data, then base64 encode (24 chars)
        let mut rng = rand::thread_rng();
        let nonce_bytes: [u8; 18] = rng.gen();
        Self::with_nonce(username, password, &BASE64.encode(nonce_bytes))
    }

    /// Create a SCRAM client with a caller-chosen nonce.
    pub fn with_nonce(username: &str, password: &str, client_nonce: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            client_nonce: client_nonce.to_string(),
            combined_nonce: None,
            server_first: None,
            salt: None,
            iterations: None,
            salted_password: None,
            auth_message: None,
        }
    }

    /// The client-first-message-bare: `n=<username>,r=<client-nonce>`.
    pub fn compose_challenge(&self) -> String {
        format!("n={},r={}", sasl_name(&self.username), self.client_nonce)
    }

    /// The full client-first-message as sent on the wire (GS2 header + bare).
    pub fn client_first_message(&self) -> Vec<u8> {
        format!("{}{}", GS2_HEADER, self.compose_challenge()).into_bytes()
    }

    /// Parse and store the server-first-message.
    ///
    /// Format: `r=<nonce>,s=<base64 salt>,i=<iterations>`
    pub fn receive_challenge(&mut self, server_msg: &[u8]) -> Result<(), ScramError> {
        let server_str =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;

        for part in server_str.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                nonce = Some(value.to_string());
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(BASE64.decode(value).map_err(|_| ScramError::InvalidSalt)?);
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = Some(
                    value
                        .parse::<u32>()
                        .map_err(|_| ScramError::InvalidIterations)?,
                );
            } else if part.starts_with("m=") {
                // Mandatory extensions are not supported (RFC 5802 §5.1).
                return Err(ScramError::InvalidServerMessage);
            }
        }

        let combined_nonce = nonce.ok_or(ScramError::MissingNonce)?;
        let salt = salt.ok_or(ScramError::MissingSalt)?;
        let iterations = iterations.ok_or(ScramError::MissingIterations)?;

        if iterations == 0 {
            return Err(ScramError::InvalidIterations);
        }

        // The server must extend our nonce, not replace it.
        if combined_nonce.len() <= self.client_nonce.len()
            || !combined_nonce.starts_with(&self.client_nonce)
        {
            return Err(ScramError::NonceVerificationFailed);
        }

        self.combined_nonce = Some(combined_nonce);
        self.server_first = Some(server_str.to_string());
        self.salt = Some(salt);
        self.iterations = Some(iterations);
        Ok(())
    }

    /// Compute the client proof and return the client-final-message.
    pub fn compose_response(&mut self) -> Result<String, ScramError> {
        let combined_nonce = self.combined_nonce.as_ref().ok_or(ScramError::InvalidState)?;
        let server_first = self.server_first.as_ref().ok_or(ScramError::InvalidState)?;
        let salt = self.salt.as_ref().ok_or(ScramError::InvalidState)?;
        let iterations = self.iterations.ok_or(ScramError::InvalidState)?;

        let salted_password = salted_password(&self.password, salt, iterations)?;
        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key = sha256(&client_key);

        let client_final_without_proof = format!("c={},r={}", CHANNEL_BINDING, combined_nonce);
        let auth_message = format!(
            "{},{},{}",
            self.compose_challenge(),
            server_first,
            client_final_without_proof
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        let client_proof = xor_bytes(&client_key, &client_signature);

        self.salted_password = Some(salted_password);
        self.auth_message = Some(auth_message);

        Ok(format!(
            "{},p={}",
            client_final_without_proof,
            BASE64.encode(client_proof)
        ))
    }

    /// Verify the server's final message (server signature).
    ///
    /// Format: `v=<base64 signature>` or `e=<error>`
    pub fn receive_response(&self, server_msg: &[u8]) -> Result<(), ScramError> {
        let server_str =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;

        if let Some(error) = server_str.strip_prefix("e=") {
            return Err(ScramError::ServerRejected(error.to_string()));
        }

        // Extensions may follow the verifier.
        let verifier_b64 = server_str
            .split(',')
            .next()
            .and_then(|v| v.strip_prefix("v="))
            .ok_or(ScramError::InvalidServerSignature)?;

        let server_signature = BASE64
            .decode(verifier_b64)
            .map_err(|_| ScramError::InvalidServerSignature)?;

        let salted_password = self.salted_password.ok_or(ScramError::InvalidState)?;
        let auth_message = self.auth_message.as_ref().ok_or(ScramError::InvalidState)?;

        let server_key = hmac_sha256(&salted_password, b"Server Key")?;
        let expected_signature = hmac_sha256(&server_key, auth_message.as_bytes())?;

        if server_signature != expected_signature {
            return Err(ScramError::ServerSignatureVerificationFailed);
        }

        Ok(())
    }
}

/// SCRAM authentication errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScramError {
    InvalidServerMessage,
    InvalidSalt,
    InvalidIterations,
    MissingNonce,
    MissingSalt,
    MissingIterations,
    NonceVerificationFailed,
    InvalidServerSignature,
    ServerSignatureVerificationFailed,
    ServerRejected(String),
    InvalidState,
}

impl std::fmt::Display for ScramError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidServerMessage => write!(f, "Invalid server message"),
            Self::InvalidSalt => write!(f, "Invalid salt encoding"),
            Self::InvalidIterations => write!(f, "Invalid iteration count"),
            Self::MissingNonce => write!(f, "Missing nonce in server message"),
            Self::MissingSalt => write!(f, "Missing salt in server message"),
            Self::MissingIterations => write!(f, "Missing iterations in server message"),
            Self::NonceVerificationFailed => write!(f, "Server nonce verification failed"),
            Self::InvalidServerSignature => write!(f, "Invalid server signature"),
            Self::ServerSignatureVerificationFailed => {
                write!(f, "Server signature verification failed")
            }
            Self::ServerRejected(e) => write!(f, "Server rejected authentication: {}", e),
            Self::InvalidState => write!(f, "Invalid SCRAM state"),
        }
    }
}

impl std::error::Error for ScramError {}

// ============================================================================
// Helper Functions
// ============================================================================

/// Hi() function - PBKDF2 with HMAC-SHA-256
pub(crate) fn salted_password(
    password: &str,
    salt: &[u8],
    iterations: u32,
) -> Result<[u8; 32], ScramError> {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut output)
        .map_err(|_| ScramError::InvalidState)?;
    Ok(output)
}

/// HMAC-SHA-256
pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], ScramError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| ScramError::InvalidState)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// SHA-256 hash
pub(crate) fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// XOR two byte arrays
pub(crate) fn xor_bytes(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut result = [0u8; 32];
    for (r, (x, y)) in result.iter_mut().zip(a.iter().zip(b.iter())) {
        *r = x ^ y;
    }
    result
}

/// Escape `,` and `=` in a SCRAM username (RFC 5802 §5.1).
///
/// Full SASLprep (RFC 4013) is not applied. PostgreSQL ignores the SCRAM
/// username in favour of the startup packet's `user`.
fn sasl_name(s: &str) -> String {
    s.replace('=', "=3D").replace(',', "=2C")
}
