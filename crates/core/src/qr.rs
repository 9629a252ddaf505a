//! Worker QR payloads: `ID:<worker id>|HASH:<hash>|RUT:<rut>`.

use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::rut::normalize_rut;

/// Decoded worker QR payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrPayload {
    pub worker_id: i64,
    pub hash: String,
    pub rut: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QrPayloadError {
    #[error("QR payload must have the form ID:<id>|HASH:<hash>|RUT:<rut>")]
    Malformed,
    #[error("QR payload carries an invalid worker id")]
    InvalidId,
    #[error("QR payload carries an invalid RUT")]
    InvalidRut,
}

impl QrPayload {
    pub fn encode(&self) -> String {
        format!("ID:{}|HASH:{}|RUT:{}", self.worker_id, self.hash, self.rut)
    }

    pub fn parse(raw: &str) -> Result<Self, QrPayloadError> {
        let mut parts = raw.trim().split('|');
        let (Some(id), Some(hash), Some(rut), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(QrPayloadError::Malformed);
        };

        let id = id.strip_prefix("ID:").ok_or(QrPayloadError::Malformed)?;
        let hash = hash.strip_prefix("HASH:").ok_or(QrPayloadError::Malformed)?;
        let rut = rut.strip_prefix("RUT:").ok_or(QrPayloadError::Malformed)?;

        let worker_id = id.parse::<i64>().map_err(|_| QrPayloadError::InvalidId)?;
        if hash.is_empty() {
            return Err(QrPayloadError::Malformed);
        }
        let rut = normalize_rut(rut).map_err(|_| QrPayloadError::InvalidRut)?;

        Ok(Self {
            worker_id,
            hash: hash.to_string(),
            rut,
        })
    }
}

/// Fresh validation hash: hex SHA-256 of a random UUIDv4.
pub fn generate_validation_hash() -> String {
    let seed = Uuid::new_v4();
    hex::encode(Sha256::digest(seed.to_string().as_bytes()))
}
