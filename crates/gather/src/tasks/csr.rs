//! Certificate signing requests, reduced to anonymized features.
//!
//! A request is kept unless its issued certificate parsed and is currently
//! within its validity window.

use std::net::{Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, SecondsFormat, Utc};
use harvest_core::{JsonMarshaller, Record, TaskOutput};
use harvest_kubehub::{ListQuery, Profile};
use k8s_openapi::api::certificates::v1::{CertificateSigningRequest, CertificateSigningRequestCondition};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;
use tracing::debug;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::objects::{oid2sn, oid_registry};
use x509_parser::der_parser::oid::Oid;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::{AttributeTypeAndValue, FromDer, X509CertificationRequest, X509Name};

use crate::{access_failure, TaskContext};

const GATHER_LIMIT: usize = 5000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NameFeatures {
    pub common_name: String,
    pub country: Vec<String>,
    pub organization: Vec<String>,
    pub organizational_unit: Vec<String>,
    pub locality: Vec<String>,
    pub province: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestFeatures {
    pub valid_signature: bool,
    pub signature_algorithm: String,
    pub public_key_algorithm: String,
    #[serde(rename = "DNSNames")]
    pub dns_names: Vec<String>,
    pub email_addresses: Vec<String>,
    #[serde(rename = "IPAddresses")]
    pub ip_addresses: Vec<String>,
    #[serde(rename = "URIs")]
    pub uris: Vec<String>,
    pub subject: NameFeatures,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SpecFeatures {
    pub username: Option<String>,
    pub groups: Vec<String>,
    pub usages: Vec<String>,
    pub request: Option<RequestFeatures>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CertFeatures {
    pub verified: bool,
    pub issuer: NameFeatures,
    pub subject: NameFeatures,
    pub not_before: String,
    pub not_after: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusFeatures {
    pub conditions: Vec<CertificateSigningRequestCondition>,
    pub cert: Option<CertFeatures>,
}

/// What is recorded for one request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CsrFeatures {
    pub object_meta: ObjectMeta,
    pub spec: SpecFeatures,
    pub status: Option<StatusFeatures>,
}

impl CsrFeatures {
    pub fn from_request(r: CertificateSigningRequest) -> Self {
        let name = r.metadata.name.clone().unwrap_or_default();
        let request = request_features(&r.spec.request.0).map_err(|e| debug!(csr = %name, error = %e, "csr: request not decoded")).ok();
        let spec = SpecFeatures {
            username: r.spec.username,
            groups: r.spec.groups.unwrap_or_default(),
            usages: r.spec.usages.unwrap_or_default(),
            request,
        };
        let status = r.status.map(|s| {
            let cert = s.certificate.as_ref().and_then(|c| match cert_features(&c.0) {
                Ok(f) => Some(f),
                Err(e) => {
                    debug!(csr = %name, error = %e, "csr: certificate not decoded");
                    None
                }
            });
            StatusFeatures { conditions: s.conditions.unwrap_or_default(), cert }
        });
        Self { object_meta: r.metadata, spec, status }
    }

    /// Excluded only when the certificate parsed and `now` is inside its window.
    pub fn include(&self, now: DateTime<Utc>) -> bool {
        let Some(cert) = self.status.as_ref().and_then(|s| s.cert.as_ref()) else {
            return true;
        };
        if !cert.verified {
            return true;
        }
        let parse = |s: &str| DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc));
        if parse(&cert.not_before).is_some_and(|t| now < t) {
            return true;
        }
        parse(&cert.not_after).is_some_and(|t| now > t)
    }
}

fn anonymized(values: Vec<String>) -> Vec<String> { values.iter().map(|v| harvest_anonymize::string(v)).collect() }

fn texts<'b, 'a: 'b, I>(it: I) -> Vec<String>
where
    I: Iterator<Item = &'b AttributeTypeAndValue<'a>>,
{
    it.filter_map(|a| a.as_str().ok().map(str::to_string)).collect()
}

fn name_features(n: &X509Name<'_>) -> NameFeatures {
    NameFeatures {
        common_name: harvest_anonymize::string(&texts(n.iter_common_name()).concat()),
        country: anonymized(texts(n.iter_country())),
        organization: anonymized(texts(n.iter_organization())),
        organizational_unit: anonymized(texts(n.iter_organizational_unit())),
        locality: anonymized(texts(n.iter_locality())),
        province: anonymized(texts(n.iter_state_or_province())),
    }
}

fn algorithm_name(oid: &Oid<'_>) -> String {
    oid2sn(oid, oid_registry()).map(str::to_string).unwrap_or_else(|_| oid.to_id_string())
}

fn rfc3339(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0).map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)).unwrap_or_default()
}

/// Features of an issued certificate in PEM form.
pub fn cert_features(pem: &[u8]) -> anyhow::Result<CertFeatures> {
    let (_, pem) = parse_x509_pem(pem).map_err(|e| anyhow::anyhow!("pem: {e}"))?;
    let cert = pem.parse_x509().map_err(|e| anyhow::anyhow!("x509: {e}"))?;
    let validity = cert.validity();
    Ok(CertFeatures {
        verified: true,
        issuer: name_features(cert.issuer()),
        subject: name_features(cert.subject()),
        not_before: rfc3339(validity.not_before.timestamp()),
        not_after: rfc3339(validity.not_after.timestamp()),
    })
}

fn ip_text(raw: &[u8]) -> String {
    match raw.len() {
        4 => <[u8; 4]>::try_from(raw).map(|b| Ipv4Addr::from(b).to_string()).unwrap_or_default(),
        16 => <[u8; 16]>::try_from(raw).map(|b| Ipv6Addr::from(b).to_string()).unwrap_or_default(),
        _ => String::new(),
    }
}

/// Features of a PEM certification request; fails on a bad signature.
pub fn request_features(pem: &[u8]) -> anyhow::Result<RequestFeatures> {
    let (_, pem) = parse_x509_pem(pem).map_err(|e| anyhow::anyhow!("pem: {e}"))?;
    let (_, csr) = X509CertificationRequest::from_der(&pem.contents).map_err(|e| anyhow::anyhow!("csr: {e}"))?;
    csr.verify_signature().map_err(|e| anyhow::anyhow!("signature: {e}"))?;
    let info = &csr.certification_request_info;
    let mut f = RequestFeatures {
        valid_signature: true,
        signature_algorithm: algorithm_name(&csr.signature_algorithm.algorithm),
        public_key_algorithm: algorithm_name(&info.subject_pki.algorithm.algorithm),
        subject: name_features(&info.subject),
        ..RequestFeatures::default()
    };
    for ext in csr.requested_extensions().into_iter().flatten() {
        let ParsedExtension::SubjectAlternativeName(san) = ext else { continue };
        for name in &san.general_names {
            match name {
                GeneralName::DNSName(s) => f.dns_names.push(harvest_anonymize::url(s)),
                GeneralName::RFC822Name(s) => f.email_addresses.push(harvest_anonymize::url(s)),
                GeneralName::URI(s) => f.uris.push(harvest_anonymize::url(s)),
                GeneralName::IPAddress(raw) => f.ip_addresses.push(harvest_anonymize::url(&ip_text(raw))),
                _ => {}
            }
        }
    }
    Ok(f)
}

pub async fn gather(ctx: TaskContext) -> TaskOutput { gather_at(ctx, Utc::now()).await }

/// Same as [`gather`], deciding validity windows against `now`.
pub async fn gather_at(ctx: TaskContext, now: DateTime<Utc>) -> TaskOutput {
    let q = ListQuery::default().with_limit(GATHER_LIMIT as u32);
    let listed = ctx
        .clients
        .workload(Profile::Proto)
        .list_with::<CertificateSigningRequest>(None, &q, ctx.budget(GATHER_LIMIT))
        .await;
    let paged = match listed {
        Ok(p) => p,
        Err(e) => return access_failure("listing certificatesigningrequests", e),
    };
    let warnings = paged.warnings();
    let mut out = TaskOutput::new();
    for r in paged.items {
        let features = CsrFeatures::from_request(r);
        if !features.include(now) {
            continue;
        }
        let name = format!("config/certificatesigningrequests/{}", features.object_meta.name.as_deref().unwrap_or_default());
        out.push(Record::new(name, JsonMarshaller(features)));
    }
    for w in warnings {
        out.warn(w);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cert(not_before: &str, not_after: &str, verified: bool) -> CsrFeatures {
        CsrFeatures {
            object_meta: ObjectMeta::default(),
            spec: SpecFeatures::default(),
            status: Some(StatusFeatures {
                conditions: Vec::new(),
                cert: Some(CertFeatures {
                    verified,
                    issuer: NameFeatures::default(),
                    subject: NameFeatures::default(),
                    not_before: not_before.into(),
                    not_after: not_after.into(),
                }),
            }),
        }
    }

    #[test]
    fn filter_decisions() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).single().expect("time");
        let no_cert = CsrFeatures { object_meta: ObjectMeta::default(), spec: SpecFeatures::default(), status: None };
        assert!(no_cert.include(now));
        assert!(cert("2024-01-01T00:00:00Z", "2025-01-01T00:00:00Z", false).include(now));
        assert!(cert("2024-07-01T00:00:00Z", "2025-01-01T00:00:00Z", true).include(now));
        assert!(cert("2023-01-01T00:00:00Z", "2024-01-01T00:00:00Z", true).include(now));
        assert!(!cert("2024-01-01T00:00:00Z", "2025-01-01T00:00:00Z", true).include(now));
    }

    #[test]
    fn certificate_features_are_anonymized() {
        let f = cert_features(include_bytes!("../../tests/fixtures/node-valid.crt")).expect("cert");
        assert!(f.verified);
        assert_eq!(f.subject.common_name, "x".repeat("system:node:worker-0".len()));
        assert_eq!(f.subject.organization, vec!["x".repeat("system:nodes".len())]);
        assert_eq!(f.not_before, "2020-01-01T00:00:00Z");
        assert!(cert_features(b"not a certificate").is_err());
    }

    #[test]
    fn request_alt_names_are_masked() {
        let f = request_features(include_bytes!("../../tests/fixtures/node.csr")).expect("csr");
        assert!(f.valid_signature);
        assert_eq!(f.dns_names, vec!["xxxxxx-x.xxxxxxx.xxx"]);
        assert_eq!(f.ip_addresses, vec!["xx.x.x.x"]);
        assert!(f.email_addresses.is_empty());
    }
}
