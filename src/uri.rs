//! Store-identifier URI parsing.
//!
//! ```text
//! [btrfs://]/abs/path/[snapshot]        local btrfs
//! s3://bucket/prefix/[snapshot]          S3
//! ssh://[user@]host/abs/path/[snapshot]  remote btrfs
//! ```
//!
//! A trailing `/` means "directory of snapshots"; its absence on a source
//! means "that single snapshot only". Dispatch on the scheme follows the
//! same pattern as `blockdev::open`'s path-pattern dispatch in the teacher
//! repo.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UriError {
    #[error("empty store URI")]
    Empty,
    #[error("s3 URI missing bucket name: {0}")]
    MissingBucket(String),
    #[error("ssh URI missing host: {0}")]
    MissingHost(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreUri {
    Local {
        path: String,
        directory: bool,
    },
    S3 {
        bucket: String,
        prefix: String,
        directory: bool,
    },
    Ssh {
        user: Option<String>,
        host: String,
        path: String,
        directory: bool,
    },
}

impl StoreUri {
    pub fn parse(raw: &str) -> Result<StoreUri, UriError> {
        if raw.is_empty() {
            return Err(UriError::Empty);
        }
        let directory = raw.ends_with('/');

        if let Some(rest) = raw.strip_prefix("s3://") {
            let rest = rest.trim_end_matches('/');
            let (bucket, prefix) = match rest.split_once('/') {
                Some((b, p)) => (b, p),
                None => (rest, ""),
            };
            if bucket.is_empty() {
                return Err(UriError::MissingBucket(raw.to_string()));
            }
            return Ok(StoreUri::S3 {
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
                directory,
            });
        }

        if let Some(rest) = raw.strip_prefix("ssh://") {
            let rest = rest.trim_end_matches('/');
            let (authority, path) = match rest.split_once('/') {
                Some((a, p)) => (a, format!("/{p}")),
                None => (rest, "/".to_string()),
            };
            let (user, host) = match authority.split_once('@') {
                Some((u, h)) => (Some(u.to_string()), h.to_string()),
                None => (None, authority.to_string()),
            };
            if host.is_empty() {
                return Err(UriError::MissingHost(raw.to_string()));
            }
            return Ok(StoreUri::Ssh {
                user,
                host,
                path,
                directory,
            });
        }

        let path = raw.strip_prefix("btrfs://").unwrap_or(raw);
        Ok(StoreUri::Local {
            path: path.trim_end_matches('/').to_string(),
            directory,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_local_with_explicit_scheme() {
        let uri = StoreUri::parse("btrfs:///mnt/pool/snap").unwrap();
        assert_eq!(
            uri,
            StoreUri::Local {
                path: "/mnt/pool/snap".to_string(),
                directory: false
            }
        );
    }

    #[test]
    fn parses_local_without_scheme() {
        let uri = StoreUri::parse("/mnt/pool/").unwrap();
        assert_eq!(
            uri,
            StoreUri::Local {
                path: "/mnt/pool".to_string(),
                directory: true
            }
        );
    }

    #[test]
    fn parses_s3_with_prefix() {
        let uri = StoreUri::parse("s3://my-bucket/backups/snap1").unwrap();
        assert_eq!(
            uri,
            StoreUri::S3 {
                bucket: "my-bucket".to_string(),
                prefix: "backups/snap1".to_string(),
                directory: false
            }
        );
    }

    #[test]
    fn parses_s3_bucket_only() {
        let uri = StoreUri::parse("s3://my-bucket/").unwrap();
        assert_eq!(
            uri,
            StoreUri::S3 {
                bucket: "my-bucket".to_string(),
                prefix: "".to_string(),
                directory: true
            }
        );
    }

    #[test]
    fn rejects_s3_without_bucket() {
        assert_eq!(StoreUri::parse("s3://"), Err(UriError::MissingBucket("s3://".to_string())));
    }

    #[test]
    fn parses_ssh_with_user() {
        let uri = StoreUri::parse("ssh://alice@host.example/data/snap").unwrap();
        assert_eq!(
            uri,
            StoreUri::Ssh {
                user: Some("alice".to_string()),
                host: "host.example".to_string(),
                path: "/data/snap".to_string(),
                directory: false
            }
        );
    }

    #[test]
    fn parses_ssh_without_user() {
        let uri = StoreUri::parse("ssh://host.example/data/").unwrap();
        assert_eq!(
            uri,
            StoreUri::Ssh {
                user: None,
                host: "host.example".to_string(),
                path: "/data".to_string(),
                directory: true
            }
        );
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(StoreUri::parse(""), Err(UriError::Empty));
    }
}
