//! PEM block scanning and configmap payload anonymization.

use std::io::Cursor;

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use harvest_core::Marshaller;
use x509_parser::pem::Pem;

pub const ANONYMIZED_BLOCK: &str = "-----BEGIN CERTIFICATE-----\nANONYMIZED\n-----END CERTIFICATE-----\n";

/// One decoded PEM block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PemBlock {
    pub label: String,
    pub der: Vec<u8>,
}

impl From<Pem> for PemBlock {
    fn from(p: Pem) -> Self { Self { label: p.label, der: p.contents } }
}

/// Leading valid blocks of `input`, in order.
pub fn blocks(input: &[u8]) -> Vec<PemBlock> {
    Pem::iter_from_buffer(input).map_while(|p| p.ok()).map(PemBlock::from).collect()
}

/// Replace each PEM block with a canonical anonymized certificate block.
///
/// Input that is not a sequence of valid blocks (trailing whitespace aside)
/// is returned unchanged.
pub fn anonymize_pem(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut pos = 0;
    while !input[pos..].iter().all(u8::is_ascii_whitespace) {
        match Pem::read(Cursor::new(&input[pos..])) {
            Ok((_, read)) if read > 0 => {
                out.extend_from_slice(ANONYMIZED_BLOCK.as_bytes());
                pos += read;
            }
            _ => return input.to_vec(),
        }
    }
    if out.is_empty() {
        return input.to_vec();
    }
    out
}

/// Configmap payload marshaller; PEM content is anonymized lazily.
#[derive(Debug, Clone)]
pub struct ConfigMapAnonymizer {
    pub data: Vec<u8>,
    /// binaryData entries are emitted base64-encoded.
    pub encode_base64: bool,
}

impl ConfigMapAnonymizer {
    pub fn text(data: &str) -> Self { Self { data: data.as_bytes().to_vec(), encode_base64: false } }
    pub fn binary(data: Vec<u8>) -> Self { Self { data, encode_base64: true } }
}

impl Marshaller for ConfigMapAnonymizer {
    fn marshal(&self) -> Result<Vec<u8>> {
        let c = anonymize_pem(&self.data);
        if self.encode_base64 {
            return Ok(STANDARD.encode(c).into_bytes());
        }
        Ok(c)
    }
    fn extension(&self) -> &'static str { "" }
}
