//! Records and the marshallers that produce their bodies.

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

pub const JSON_EXTENSION: &str = "json";

/// Produces the byte body of a record on demand.
pub trait Marshaller: Send + Sync {
    fn marshal(&self) -> Result<Vec<u8>>;
    /// File extension without the dot; empty means the name is used verbatim.
    fn extension(&self) -> &'static str;
}

/// One file of the produced archive.
#[derive(Clone)]
pub struct Record {
    pub name: String,
    pub item: Arc<dyn Marshaller>,
    pub always_stored: bool,
    pub captured_at: Option<DateTime<Utc>>,
}

impl Record {
    pub fn new(name: impl Into<String>, item: impl Marshaller + 'static) -> Self {
        Self { name: name.into(), item: Arc::new(item), always_stored: false, captured_at: None }
    }

    pub fn always_stored(mut self) -> Self {
        self.always_stored = true;
        self
    }

    pub fn captured_at(mut self, at: DateTime<Utc>) -> Self {
        self.captured_at = Some(at);
        self
    }

    /// Archive path: `name.ext`, or `name` when the extension is empty.
    pub fn path(&self) -> String {
        let ext = self.item.extension();
        if ext.is_empty() { self.name.clone() } else { format!("{}.{}", self.name, ext) }
    }

    pub fn marshal(&self) -> Result<Vec<u8>> {
        self.item.marshal().with_context(|| format!("marshalling record {}", self.name))
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("name", &self.name)
            .field("extension", &self.item.extension())
            .field("always_stored", &self.always_stored)
            .finish()
    }
}

/// Serializes a cluster object to canonical JSON, dropping server bookkeeping.
pub struct ResourceMarshaller<T>(pub T);

impl<T: Serialize + Send + Sync> Marshaller for ResourceMarshaller<T> {
    fn marshal(&self) -> Result<Vec<u8>> {
        let mut v = serde_json::to_value(&self.0).context("serializing resource")?;
        #[cfg(feature = "strip-managed-fields")]
        strip_managed_fields(&mut v);
        Ok(serde_json::to_vec(&v)?)
    }
    fn extension(&self) -> &'static str { JSON_EXTENSION }
}

/// Serializes any value to JSON as-is.
pub struct JsonMarshaller<T>(pub T);

impl<T: Serialize + Send + Sync> Marshaller for JsonMarshaller<T> {
    fn marshal(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.0)?)
    }
    fn extension(&self) -> &'static str { JSON_EXTENSION }
}

/// Emits bytes unchanged.
#[derive(Debug, Clone)]
pub struct RawBytes(pub Bytes);

impl RawBytes {
    pub fn text(s: impl Into<String>) -> Self { Self(Bytes::from(s.into())) }
}

impl Marshaller for RawBytes {
    fn marshal(&self) -> Result<Vec<u8>> { Ok(self.0.to_vec()) }
    fn extension(&self) -> &'static str { "" }
}

/// JSON that is already encoded (e.g. a scraped API response).
#[derive(Debug, Clone)]
pub struct RawJson(pub Bytes);

impl Marshaller for RawJson {
    fn marshal(&self) -> Result<Vec<u8>> { Ok(self.0.to_vec()) }
    fn extension(&self) -> &'static str { JSON_EXTENSION }
}

pub fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}
