//! SCRAM-SHA-256 Authentication
//!
//! SASL SCRAM-SHA-256 without channel binding (RFC 5802, RFC 7677).

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

const NONCE_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Client side of one SCRAM exchange.
pub struct ScramClient {
    password: String,
    client_nonce: String,
    auth_message: Option<String>,
    salted_password: Option<Vec<u8>>,
}

impl ScramClient {
    pub fn new(password: &str) -> Self {
        let mut rng = rand::rng();
        let client_nonce = (0..24)
            .map(|_| NONCE_CHARS[rng.random_range(0..NONCE_CHARS.len())] as char)
            .collect();
        Self::with_nonce(password, client_nonce)
    }

    fn with_nonce(password: &str, client_nonce: String) -> Self {
        Self {
            password: password.to_string(),
            client_nonce,
            auth_message: None,
            salted_password: None,
        }
    }

    /// `n,,n=,r=<nonce>`. The server takes the user name from the startup
    /// packet, so the SCRAM user is left empty.
    pub fn client_first_message(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare()).into_bytes()
    }

    fn client_first_bare(&self) -> String {
        format!("n=,r={}", self.client_nonce)
    }

    /// Consume `r=<nonce>,s=<salt>,i=<iterations>` and produce the client-final-message.
    pub fn process_server_first(&mut self, server_msg: &[u8]) -> Result<Vec<u8>, String> {
        let server_str =
            std::str::from_utf8(server_msg).map_err(|_| "Invalid UTF-8 in server message")?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in server_str.split(',') {
            if let Some(v) = part.strip_prefix("r=") {
                nonce = Some(v);
            } else if let Some(v) = part.strip_prefix("s=") {
                salt = Some(BASE64.decode(v).map_err(|_| "Invalid salt base64")?);
            } else if let Some(v) = part.strip_prefix("i=") {
                iterations = Some(v.parse::<u32>().map_err(|_| "Invalid iteration count")?);
            }
        }

        let nonce = nonce.ok_or("Missing nonce in server message")?;
        let salt = salt.ok_or("Missing salt in server message")?;
        let iterations = iterations.ok_or("Missing iterations in server message")?;

        if !nonce.starts_with(&self.client_nonce) {
            return Err("Server nonce doesn't contain client nonce".to_string());
        }

        let mut salted = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(self.password.as_bytes(), &salt, iterations, &mut salted);

        let client_key = hmac(&salted, b"Client Key")?;
        let stored_key = Sha256::digest(&client_key);

        // biws = base64("n,,")
        let client_final_without_proof = format!("c=biws,r={}", nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_str,
            client_final_without_proof
        );

        let client_signature = hmac(&stored_key, auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();

        self.auth_message = Some(auth_message);
        self.salted_password = Some(salted.to_vec());

        Ok(format!("{},p={}", client_final_without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Check the `v=<signature>` the server sends back.
    pub fn verify_server_final(&self, server_msg: &[u8]) -> Result<(), String> {
        let server_str = std::str::from_utf8(server_msg)
            .map_err(|_| "Invalid UTF-8 in server final message")?;
        let verifier = server_str
            .strip_prefix("v=")
            .ok_or("Missing verifier in server final message")?;
        let expected = BASE64
            .decode(verifier)
            .map_err(|_| "Invalid base64 in server signature")?;

        let salted = self
            .salted_password
            .as_ref()
            .ok_or("Missing salted password")?;
        let auth_message = self.auth_message.as_ref().ok_or("Missing auth message")?;

        let server_key = hmac(salted, b"Server Key")?;
        if hmac(&server_key, auth_message.as_bytes())? != expected {
            return Err("Server signature verification failed".to_string());
        }
        Ok(())
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, String> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| e.to_string())?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_first_message() {
        let client = ScramClient::new("password");
        let msg = String::from_utf8(client.client_first_message()).unwrap();
        assert!(msg.starts_with("n,,n=,r="));
        assert_eq!(msg.len(), "n,,n=,r=".len() + 24);
    }

    #[test]
    fn test_rejects_foreign_nonce() {
        let mut client = ScramClient::with_nonce("pw", "abc".to_string());
        let salt = BASE64.encode(b"salt");
        let err = client
            .process_server_first(format!("r=xyz123,s={},i=4096", salt).as_bytes())
            .unwrap_err();
        assert!(err.contains("nonce"));
    }

    // Nonce and salt from RFC 7677; the user is empty so the proof differs from the RFC.
    #[test]
    fn test_full_exchange_verifies_server_signature() {
        let mut client = ScramClient::with_nonce("pencil", "rOprNGfwEbeRWgbNEkqO".to_string());
        let server_first = "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
        let final_msg = client.process_server_first(server_first.as_bytes()).unwrap();
        let final_str = String::from_utf8(final_msg).unwrap();
        assert!(final_str.starts_with("c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p="));

        // Compute what an honest server would send back.
        let salted = client.salted_password.clone().unwrap();
        let server_key = hmac(&salted, b"Server Key").unwrap();
        let sig = hmac(&server_key, client.auth_message.as_ref().unwrap().as_bytes()).unwrap();
        let server_final = format!("v={}", BASE64.encode(sig));

        assert!(client.verify_server_final(server_final.as_bytes()).is_ok());
        assert!(client.verify_server_final(b"v=AAAA").is_err());
    }
}
