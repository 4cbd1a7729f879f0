//! S3-compatible blob store (AWS S3, MinIO) over plain HTTP.
//!
//! Requests are signed with AWS Signature Version 4 using `hmac` and `sha2`, and objects are
//! addressed path-style (`<endpoint>/<bucket>/<key>`) so MinIO works without DNS tricks.
//! Uploads stream the body with `UNSIGNED-PAYLOAD` and an explicit `Content-Length`, and send
//! `If-None-Match: *` so an existing key is never overwritten.

use super::{BlobError, BlobLocation, BlobObject, BlobStore, ByteStream};
use async_trait::async_trait;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, IF_NONE_MATCH};
use reqwest::{Client, Method, StatusCode};
use sha2::{Digest, Sha256};
use std::time::Duration;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

type HmacSha256 = Hmac<Sha256>;

const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Connection settings for an S3-compatible endpoint.
#[derive(Debug, Clone)]
pub struct S3Settings {
    /// Endpoint URL, e.g. `http://127.0.0.1:9000`.
    pub endpoint: String,
    /// Signing region.
    pub region: String,
    /// Access key id.
    pub access_key: String,
    /// Secret access key.
    pub secret_key: String,
}

/// Blob store speaking the S3 REST protocol.
pub struct S3BlobStore {
    client: Client,
    base_url: String,
    region: String,
    access_key: String,
    secret_key: String,
}

impl S3BlobStore {
    /// Build a client for the given endpoint.
    pub fn new(settings: S3Settings, connect_timeout: Duration) -> Result<Self, BlobError> {
        let parsed = reqwest::Url::parse(&settings.endpoint)
            .map_err(|err| BlobError::InvalidEndpoint(err.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| BlobError::InvalidEndpoint(settings.endpoint.clone()))?;
        let authority = match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let client = Client::builder()
            .user_agent("docstream/0.1")
            .connect_timeout(connect_timeout)
            .build()?;

        tracing::debug!(endpoint = %authority, region = %settings.region, "Initialized object store client");
        Ok(Self {
            client,
            base_url: format!("{}://{authority}", parsed.scheme()),
            region: settings.region,
            access_key: settings.access_key,
            secret_key: settings.secret_key,
        })
    }

    fn signed_request(
        &self,
        method: Method,
        canonical_uri: &str,
        query: &[(&str, String)],
        payload_hash: &str,
    ) -> reqwest::RequestBuilder {
        let now = OffsetDateTime::now_utc();
        let date_stamp = format!("{:04}{:02}{:02}", now.year(), u8::from(now.month()), now.day());
        let amz_date = format!(
            "{date_stamp}T{:02}{:02}{:02}Z",
            now.hour(),
            now.minute(),
            now.second()
        );

        let mut sorted: Vec<(String, String)> = query
            .iter()
            .map(|(key, value)| (uri_encode(key), uri_encode(value)))
            .collect();
        sorted.sort();
        let canonical_query = sorted
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join("&");

        let host = self
            .base_url
            .split_once("://")
            .map(|(_, authority)| authority)
            .unwrap_or(&self.base_url);
        let canonical_headers =
            format!("host:{host}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{amz_date}\n");
        let signed_headers = "host;x-amz-content-sha256;x-amz-date";
        let canonical_request = format!(
            "{method}\n{canonical_uri}\n{canonical_query}\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
        );

        let credential_scope = format!("{date_stamp}/{}/s3/aws4_request", self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{credential_scope}\n{}",
            hex_sha256(canonical_request.as_bytes())
        );
        let signing_key = derive_signing_key(&self.secret_key, &date_stamp, &self.region, "s3");
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.access_key
        );

        let mut url = format!("{}{canonical_uri}", self.base_url);
        if !canonical_query.is_empty() {
            url.push('?');
            url.push_str(&canonical_query);
        }

        self.client
            .request(method, url)
            .header("authorization", authorization)
            .header("x-amz-content-sha256", payload_hash)
            .header("x-amz-date", amz_date)
    }

    async fn list_page(
        &self,
        bucket: &str,
        continuation: Option<&str>,
    ) -> Result<ListPage, BlobError> {
        let mut query = vec![("list-type", "2".to_string()), ("max-keys", "1000".to_string())];
        if let Some(token) = continuation {
            query.push(("continuation-token", token.to_string()));
        }
        let response = self
            .signed_request(
                Method::GET,
                &bucket_path(bucket),
                &query,
                EMPTY_PAYLOAD_SHA256,
            )
            .send()
            .await?;
        let response = ensure_success(response, bucket).await?;
        let xml = response.text().await?;
        parse_list_objects(bucket, &xml)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), BlobError> {
        let path = bucket_path(bucket);
        let response = self
            .signed_request(Method::HEAD, &path, &[], EMPTY_PAYLOAD_SHA256)
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        if response.status() != StatusCode::NOT_FOUND {
            return Err(BlobError::UnexpectedStatus {
                status: response.status(),
                body: String::new(),
            });
        }

        let response = self
            .signed_request(Method::PUT, &path, &[], EMPTY_PAYLOAD_SHA256)
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => {
                tracing::info!(bucket, "Created bucket");
                Ok(())
            }
            StatusCode::CONFLICT => Ok(()),
            status => Err(BlobError::UnexpectedStatus {
                status,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn put(
        &self,
        location: &BlobLocation,
        body: ByteStream,
        size: u64,
        content_type: &str,
    ) -> Result<(), BlobError> {
        let response = self
            .signed_request(Method::PUT, &object_path(location), &[], UNSIGNED_PAYLOAD)
            .header(CONTENT_LENGTH, size)
            .header(CONTENT_TYPE, content_type)
            .header(IF_NONE_MATCH, "*")
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {
                tracing::debug!(location = %location, size, "Stored object");
                Ok(())
            }
            StatusCode::PRECONDITION_FAILED => Err(BlobError::AlreadyExists(location.to_string())),
            status => {
                let body = response.text().await.unwrap_or_default();
                let error = BlobError::UnexpectedStatus { status, body };
                tracing::error!(location = %location, error = %error, "Object upload failed");
                Err(error)
            }
        }
    }

    async fn get(&self, location: &BlobLocation) -> Result<Bytes, BlobError> {
        let response = self
            .signed_request(Method::GET, &object_path(location), &[], EMPTY_PAYLOAD_SHA256)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(BlobError::NotFound(location.to_string()));
        }
        let response = ensure_success(response, &location.key).await?;
        Ok(response.bytes().await?)
    }

    async fn list(&self, bucket: &str) -> Result<Vec<BlobObject>, BlobError> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = self.list_page(bucket, continuation.as_deref()).await?;
            objects.extend(page.objects);
            match page.next_continuation {
                Some(token) if page.truncated => continuation = Some(token),
                _ => break,
            }
        }
        Ok(objects)
    }

    async fn delete(&self, location: &BlobLocation) -> Result<(), BlobError> {
        let response = self
            .signed_request(
                Method::DELETE,
                &object_path(location),
                &[],
                EMPTY_PAYLOAD_SHA256,
            )
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        ensure_success(response, &location.key).await.map(|_| ())
    }
}

async fn ensure_success(
    response: reqwest::Response,
    target: &str,
) -> Result<reqwest::Response, BlobError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let error = BlobError::UnexpectedStatus {
        status,
        body: body.chars().take(500).collect(),
    };
    tracing::error!(target, error = %error, "Object store request failed");
    Err(error)
}

fn bucket_path(bucket: &str) -> String {
    format!("/{}", uri_encode(bucket))
}

fn object_path(location: &BlobLocation) -> String {
    let key = location
        .key
        .split('/')
        .map(uri_encode)
        .collect::<Vec<_>>()
        .join("/");
    format!("/{}/{key}", uri_encode(&location.bucket))
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// `kSigning = HMAC(HMAC(HMAC(HMAC("AWS4" + secret, date), region), service), "aws4_request")`
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding of everything except unreserved characters.
fn uri_encode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char);
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

struct ListPage {
    objects: Vec<BlobObject>,
    truncated: bool,
    next_continuation: Option<String>,
}

fn parse_list_objects(bucket: &str, xml: &str) -> Result<ListPage, BlobError> {
    let truncated = extract_xml_value(xml, "IsTruncated").as_deref() == Some("true");
    let next_continuation = extract_xml_value(xml, "NextContinuationToken");

    let mut objects = Vec::new();
    for entry in xml.split("<Contents>").skip(1) {
        let key = extract_xml_value(entry, "Key")
            .ok_or_else(|| BlobError::MalformedListing("entry without Key".into()))?;
        let size_bytes = extract_xml_value(entry, "Size")
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);
        let last_modified = extract_xml_value(entry, "LastModified")
            .ok_or_else(|| BlobError::MalformedListing(format!("{key} has no LastModified")))
            .and_then(|value| {
                OffsetDateTime::parse(&value, &Rfc3339)
                    .map_err(|err| BlobError::MalformedListing(format!("{key}: {err}")))
            })?;
        objects.push(BlobObject {
            location: BlobLocation::new(bucket, unescape_xml(&key)),
            size_bytes,
            last_modified,
        });
    }

    Ok(ListPage {
        objects,
        truncated,
        next_continuation,
    })
}

fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(xml[start..start + end].to_string())
}

fn unescape_xml(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::bytes_stream;
    use httpmock::{
        Method::{GET, PUT},
        MockServer,
    };

    fn store_for(server: &MockServer) -> S3BlobStore {
        S3BlobStore::new(
            S3Settings {
                endpoint: server.base_url(),
                region: "us-east-1".into(),
                access_key: "AKIDEXAMPLE".into(),
                secret_key: "secret".into(),
            },
            Duration::from_secs(5),
        )
        .expect("store")
    }

    #[test]
    fn signing_key_matches_published_vector() {
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn uri_encode_escapes_reserved_characters() {
        assert_eq!(uri_encode("a b/c~d"), "a%20b%2Fc~d");
        assert_eq!(object_path(&BlobLocation::new("docs", "x y.txt")), "/docs/x%20y.txt");
    }

    #[tokio::test]
    async fn put_streams_a_signed_conditional_request() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/docs/1700000000_abc_note.txt")
                    .header("if-none-match", "*")
                    .header("x-amz-content-sha256", UNSIGNED_PAYLOAD)
                    .header("content-type", "text/plain")
                    .header_exists("authorization")
                    .body("hello world");
                then.status(200);
            })
            .await;

        let store = store_for(&server);
        store
            .put(
                &BlobLocation::new("docs", "1700000000_abc_note.txt"),
                bytes_stream("hello world"),
                11,
                "text/plain",
            )
            .await
            .expect("put");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn put_maps_precondition_failure_to_already_exists() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(PUT).path("/docs/taken.txt");
                then.status(412);
            })
            .await;

        let err = store_for(&server)
            .put(
                &BlobLocation::new("docs", "taken.txt"),
                bytes_stream("x"),
                1,
                "text/plain",
            )
            .await
            .expect_err("conflict");
        assert!(matches!(err, BlobError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn list_parses_object_entries() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/docs")
                    .query_param("list-type", "2");
                then.status(200).body(
                    "<ListBucketResult><IsTruncated>false</IsTruncated>\
                     <Contents><Key>1_a_one.txt</Key><LastModified>2024-05-01T10:00:00.000Z</LastModified><Size>12</Size></Contents>\
                     <Contents><Key>2_b_a&amp;b.txt</Key><LastModified>2024-05-02T10:00:00.000Z</LastModified><Size>3</Size></Contents>\
                     </ListBucketResult>",
                );
            })
            .await;

        let objects = store_for(&server).list("docs").await.expect("list");
        mock.assert_async().await;
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].location.key, "1_a_one.txt");
        assert_eq!(objects[0].size_bytes, 12);
        assert_eq!(objects[1].location.key, "2_b_a&b.txt");
        assert!(objects[0].last_modified < objects[1].last_modified);
    }

    #[tokio::test]
    async fn get_missing_object_is_not_found() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/docs/gone.txt");
                then.status(404);
            })
            .await;

        let err = store_for(&server)
            .get(&BlobLocation::new("docs", "gone.txt"))
            .await
            .expect_err("missing");
        assert!(matches!(err, BlobError::NotFound(_)));
    }

    #[test]
    fn truncated_listing_reports_continuation() {
        let page = parse_list_objects(
            "docs",
            "<ListBucketResult><IsTruncated>true</IsTruncated><NextContinuationToken>tok-1</NextContinuationToken></ListBucketResult>",
        )
        .expect("page");
        assert!(page.truncated);
        assert_eq!(page.next_continuation.as_deref(), Some("tok-1"));
        assert!(page.objects.is_empty());
    }
}
