//! AWS Signature Version 4: header signing and query presigning for
//! S3-compatible origins.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::percent_encode;
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{Error, ErrorKind};

type HmacSha256 = Hmac<Sha256>;

const LONG_DATETIME_FMT: &str = "%Y%m%dT%H%M%SZ";
const SHORT_DATE_FMT: &str = "%Y%m%d";

/// SHA-256 of the empty payload, used for unsigned GET bodies.
const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

// SigV4 requires encoding everything except unreserved characters:
// A-Z, a-z, 0-9, -, ., _, ~
const QUERY_CHARSET: percent_encoding::AsciiSet = percent_encoding::NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');


/// AWS credential triple, with the secret kept out of `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    access_key: String,
    secret_key: String,
    session_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Credentials {
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        session_token: Option<String>,
    ) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            session_token,
        }
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn signing_key(secret_key: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{}", secret_key).as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

fn scope(date: &str, region: &str, service: &str) -> String {
    format!("{}/{}/{}/aws4_request", date, region, service)
}

// The url crate already stores paths percent-encoded, which matches the
// canonical form SigV4 expects for S3-style keys.
fn canonical_uri(url: &Url) -> String {
    let path = url.path();
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}

/// Query parameters sorted by name, each name and value SigV4-encoded.
fn canonical_query(pairs: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = pairs
        .iter()
        .map(|(k, v)| {
            (
                percent_encode(k.as_bytes(), &QUERY_CHARSET).to_string(),
                percent_encode(v.as_bytes(), &QUERY_CHARSET).to_string(),
            )
        })
        .collect();
    encoded.sort();

    encoded
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn string_to_sign(datetime: &str, scope: &str, canonical_request: &str) -> String {
    let digest = hex::encode(Sha256::digest(canonical_request.as_bytes()));
    format!("AWS4-HMAC-SHA256\n{}\n{}\n{}", datetime, scope, digest)
}

fn host_with_port(url: &Url) -> Result<String, Error> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::new(ErrorKind::SigningFailure(format!("no host in {}", url))))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Sign a GET request with SigV4 headers. Returns the headers to attach:
/// `x-amz-date`, `x-amz-content-sha256`, optionally `x-amz-security-token`,
/// and `authorization`.
pub fn sign_get_headers(
    creds: &Credentials,
    region: &str,
    service: &str,
    url: &Url,
    now: DateTime<Utc>,
) -> Result<Vec<(String, String)>, Error> {
    let datetime = now.format(LONG_DATETIME_FMT).to_string();
    let date = now.format(SHORT_DATE_FMT).to_string();
    let host = host_with_port(url)?;

    let mut signed_header_list: Vec<(String, String)> = vec![
        ("host".to_string(), host),
        (
            "x-amz-content-sha256".to_string(),
            EMPTY_PAYLOAD_SHA256.to_string(),
        ),
        ("x-amz-date".to_string(), datetime.clone()),
    ];
    if let Some(token) = &creds.session_token {
        signed_header_list.push(("x-amz-security-token".to_string(), token.clone()));
    }
    signed_header_list.sort();

    let canonical_headers: String = signed_header_list
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();
    let signed_headers = signed_header_list
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let query_pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    let canonical_request = format!(
        "GET\n{}\n{}\n{}\n{}\n{}",
        canonical_uri(url),
        canonical_query(&query_pairs),
        canonical_headers,
        signed_headers,
        EMPTY_PAYLOAD_SHA256
    );

    let scope = scope(&date, region, service);
    let to_sign = string_to_sign(&datetime, &scope, &canonical_request);
    let key = signing_key(&creds.secret_key, &date, region, service);
    let signature = hex::encode(hmac_sha256(&key, to_sign.as_bytes()));

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        creds.access_key, scope, signed_headers, signature
    );

    let mut headers: Vec<(String, String)> = signed_header_list
        .into_iter()
        .filter(|(k, _)| k != "host")
        .collect();
    headers.push(("authorization".to_string(), authorization));
    Ok(headers)
}

/// Presign a GET URL with SigV4 query parameters, valid for `expires_in`
/// seconds. Only the `host` header is signed, so the URL works from any
/// client.
pub fn presign_get_url(
    creds: &Credentials,
    region: &str,
    service: &str,
    url: &Url,
    expires_in_secs: u64,
    now: DateTime<Utc>,
) -> Result<String, Error> {
    let datetime = now.format(LONG_DATETIME_FMT).to_string();
    let date = now.format(SHORT_DATE_FMT).to_string();
    let host = host_with_port(url)?;
    let scope = scope(&date, region, service);

    let mut query_pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    query_pairs.push((
        "X-Amz-Algorithm".to_string(),
        "AWS4-HMAC-SHA256".to_string(),
    ));
    query_pairs.push((
        "X-Amz-Credential".to_string(),
        format!("{}/{}", creds.access_key, scope),
    ));
    query_pairs.push(("X-Amz-Date".to_string(), datetime.clone()));
    query_pairs.push(("X-Amz-Expires".to_string(), expires_in_secs.to_string()));
    query_pairs.push(("X-Amz-SignedHeaders".to_string(), "host".to_string()));
    if let Some(token) = &creds.session_token {
        query_pairs.push(("X-Amz-Security-Token".to_string(), token.clone()));
    }

    let canonical_request = format!(
        "GET\n{}\n{}\nhost:{}\n\nhost\nUNSIGNED-PAYLOAD",
        canonical_uri(url),
        canonical_query(&query_pairs),
        host
    );

    let to_sign = string_to_sign(&datetime, &scope, &canonical_request);
    let key = signing_key(&creds.secret_key, &date, region, service);
    let signature = hex::encode(hmac_sha256(&key, to_sign.as_bytes()));

    let canonical = canonical_query(&query_pairs);
    let mut presigned = url.clone();
    presigned.set_query(Some(&format!(
        "{}&X-Amz-Signature={}",
        canonical, signature
    )));

    Ok(presigned.to_string())
}
