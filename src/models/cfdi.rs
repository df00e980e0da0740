use garde::Validate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::{Display, EnumString};

/// How a CFDI is looked up on the SAT portal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum VerificationMethod {
    ByReference,
    ByDocument,
}

/// Folio fiscal plus the issuer and receiver RFCs.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq, Eq)]
pub struct ReferenceTriple {
    #[garde(length(chars, min = 36, max = 36))]
    pub uuid: String,

    #[garde(length(chars, min = 12, max = 13))]
    pub issuer_rfc: String,

    #[garde(length(chars, min = 12, max = 13))]
    pub receiver_rfc: String,
}

/// Immutable input to a single verification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub enum VerificationRequest {
    ByReference(ReferenceTriple),
    ByDocument { xml: String },
}

impl VerificationRequest {
    pub fn method(&self) -> VerificationMethod {
        match self {
            Self::ByReference(_) => VerificationMethod::ByReference,
            Self::ByDocument { .. } => VerificationMethod::ByDocument,
        }
    }

    pub fn reference(&self) -> Option<&ReferenceTriple> {
        match self {
            Self::ByReference(triple) => Some(triple),
            Self::ByDocument { .. } => None,
        }
    }

    /// Hex SHA-256 of the uploaded XML; identifies by-document items.
    pub fn document_hash(&self) -> Option<String> {
        match self {
            Self::ByReference(_) => None,
            Self::ByDocument { xml } => Some(hex::encode(Sha256::digest(xml.as_bytes()))),
        }
    }
}

/// Normalized verdict extracted from the SAT response page.
///
/// Every field is best-effort: a partially populated record is still a
/// valid result. Wire names match the historical service.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerificationResult {
    pub valid: bool,
    pub message: String,
    #[serde(rename = "folio_fiscal")]
    pub uuid: String,
    #[serde(rename = "rfc_emisor")]
    pub issuer_rfc: String,
    #[serde(rename = "nombre_emisor")]
    pub issuer_name: String,
    #[serde(rename = "rfc_receptor")]
    pub receiver_rfc: String,
    #[serde(rename = "nombre_receptor")]
    pub receiver_name: String,
    #[serde(rename = "fecha_expedicion")]
    pub issued_at: String,
    #[serde(rename = "fecha_certificacion")]
    pub certified_at: String,
    #[serde(rename = "pac_certificador")]
    pub certifier: String,
    pub total: String,
    #[serde(rename = "efecto")]
    pub effect: String,
    #[serde(rename = "estado")]
    pub status: String,
    #[serde(rename = "estatus_cancelacion")]
    pub cancellation_status: String,
    #[serde(rename = "fecha_cancelacion")]
    pub cancelled_at: String,
}
