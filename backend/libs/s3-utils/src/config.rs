/// S3 configuration shared across services
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,
    /// AWS region
    pub region: String,
    /// Custom endpoint for S3-compatible storage (MinIO, LocalStack)
    pub endpoint: Option<String>,
    /// Whether to use path-style URLs (false = virtual-hosted-style)
    pub path_style: bool,
    /// Static credentials; the default AWS credential chain is used when absent
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: "my-bucket".to_string(),
            region: "us-east-1".to_string(),
            endpoint: None,
            path_style: false,
            access_key_id: None,
            secret_access_key: None,
        }
    }
}

impl S3Config {
    /// Resolve an object reference into an object key.
    ///
    /// A reference is either a bare key (`abc`, `uploads/abc.jpg`) or an
    /// HTTP(S) URL pointing at the object, such as a presigned URL. For URLs
    /// the query string is dropped, the path is percent-decoded, and a leading
    /// `<bucket>/` segment is removed for path-style addressing.
    pub fn object_key_from_ref(&self, reference: &str) -> String {
        let reference = reference.trim();

        let url = match Url::parse(reference) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => url,
            _ => return reference.to_string(),
        };

        let path = url.path().trim_start_matches('/');
        let decoded =
            String::from_utf8_lossy(&urlencoding::decode_binary(path.as_bytes())).into_owned();

        let bucket_prefix = format!("{}/", self.bucket);
        match decoded.strip_prefix(&bucket_prefix) {
            // Virtual-hosted URLs carry the bucket in the host, never in the path.
            Some(rest) if !self.is_virtual_hosted(&url) => rest.to_string(),
            _ => decoded,
        }
    }

    fn is_virtual_hosted(&self, url: &Url) -> bool {
        url.host_str()
            .map(|host| host.starts_with(&format!("{}.", self.bucket)))
            .unwrap_or(false)
    }
}
