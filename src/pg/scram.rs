//! SCRAM-SHA-256 client (RFC 5802, RFC 7677), without channel binding.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::ClientError;

type HmacSha256 = Hmac<Sha256>;

/// "n,," base64-encoded: no channel binding, no authzid.
const GS2_HEADER_B64: &str = "biws";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScramError {
    #[error("server message is not valid UTF-8")]
    NotUtf8,
    #[error("server-first-message is missing `{0}`")]
    Missing(&'static str),
    #[error("invalid `{0}` attribute in server message")]
    Invalid(&'static str),
    #[error("server nonce does not extend the client nonce")]
    NonceMismatch,
    #[error("server signature does not match")]
    SignatureMismatch,
    #[error("server rejected authentication: {0}")]
    Rejected(String),
}

impl From<ScramError> for ClientError {
    fn from(err: ScramError) -> Self {
        ClientError::Auth(err.to_string())
    }
}

/// First half of the exchange: holds the client nonce.
pub struct ScramClient {
    password: String,
    client_first_bare: String,
    nonce: String,
}

/// Second half: checks the server's final signature.
#[derive(Debug)]
pub struct ScramVerifier {
    server_signature: [u8; 32],
}

impl ScramClient {
    pub fn new(user: &str, password: &str) -> Self {
        let nonce_bytes: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(user, password, BASE64.encode(nonce_bytes))
    }

    fn with_nonce(user: &str, password: &str, nonce: String) -> Self {
        // Postgres takes the user from the startup packet and ignores `n=`.
        let client_first_bare = format!("n={},r={}", escape_name(user), nonce);
        Self {
            password: password.to_string(),
            client_first_bare,
            nonce,
        }
    }

    /// client-first-message: `n,,n=<user>,r=<nonce>`
    pub fn client_first(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare).into_bytes()
    }

    /// Answer server-first-message (`r=..,s=..,i=..`) with
    /// client-final-message and keep what is needed to verify the server.
    pub fn client_final(self, server_first: &[u8]) -> Result<(Vec<u8>, ScramVerifier), ScramError> {
        let server_first = std::str::from_utf8(server_first).map_err(|_| ScramError::NotUtf8)?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for attr in server_first.split(',') {
            match attr.split_once('=') {
                Some(("r", v)) => nonce = Some(v),
                Some(("s", v)) => {
                    salt = Some(BASE64.decode(v).map_err(|_| ScramError::Invalid("s"))?)
                }
                Some(("i", v)) => {
                    iterations = Some(v.parse::<u32>().map_err(|_| ScramError::Invalid("i"))?)
                }
                _ => {}
            }
        }
        let nonce = nonce.ok_or(ScramError::Missing("r"))?;
        let salt = salt.ok_or(ScramError::Missing("s"))?;
        let iterations = iterations.ok_or(ScramError::Missing("i"))?;
        if !nonce.starts_with(&self.nonce) || nonce.len() == self.nonce.len() {
            return Err(ScramError::NonceMismatch);
        }

        let salted = salted_password(&self.password, &salt, iterations)?;
        let client_key = hmac(&salted, b"Client Key")?;
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();

        let without_proof = format!("c={},r={}", GS2_HEADER_B64, nonce);
        let auth_message = format!("{},{},{}", self.client_first_bare, server_first, without_proof);

        let client_signature = hmac(&stored_key, auth_message.as_bytes())?;
        let mut proof = client_key;
        for (p, s) in proof.iter_mut().zip(client_signature) {
            *p ^= s;
        }

        let server_key = hmac(&salted, b"Server Key")?;
        let verifier = ScramVerifier {
            server_signature: hmac(&server_key, auth_message.as_bytes())?,
        };
        let message = format!("{},p={}", without_proof, BASE64.encode(proof));
        Ok((message.into_bytes(), verifier))
    }
}

impl ScramVerifier {
    /// Check server-final-message: `v=<signature>` or `e=<error>`.
    pub fn verify(&self, server_final: &[u8]) -> Result<(), ScramError> {
        let server_final = std::str::from_utf8(server_final).map_err(|_| ScramError::NotUtf8)?;
        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(ScramError::Rejected(err.to_string()));
        }
        let signature = server_final
            .strip_prefix("v=")
            .ok_or(ScramError::Missing("v"))?;
        let signature = BASE64
            .decode(signature.trim_end())
            .map_err(|_| ScramError::Invalid("v"))?;
        if signature != self.server_signature {
            return Err(ScramError::SignatureMismatch);
        }
        Ok(())
    }
}

fn salted_password(password: &str, salt: &[u8], iterations: u32) -> Result<[u8; 32], ScramError> {
    let mut out = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut out)
        .map_err(|_| ScramError::Invalid("s"))?;
    Ok(out)
}

fn hmac(key: &[u8], data: &[u8]) -> Result<[u8; 32], ScramError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| ScramError::Invalid("key"))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// RFC 5802 saslname escaping.
fn escape_name(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}
