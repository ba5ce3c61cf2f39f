//! Parsing of checkpoint root and array locations

use std::fmt;
use std::path::PathBuf;

use runtime_core::{Error, Result};

use crate::backend::join_key;

/// URL schemes treated as object-store roots
pub const OBJECT_STORE_SCHEMES: &[&str] = &["s3", "gs", "mem"];

/// Whether `path` names an object-store location
pub fn is_object_store_path(path: &str) -> bool {
    path.split_once("://")
        .map(|(scheme, _)| OBJECT_STORE_SCHEMES.contains(&scheme))
        .unwrap_or(false)
}

/// A filesystem path or a key prefix within an object-store bucket
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Location {
    Local(PathBuf),
    Object {
        scheme: String,
        bucket: String,
        key: String,
    },
}

impl Location {
    /// Parse `s3://bucket/key`, `gs://...`, `mem://...`, `file://path` or a plain path
    pub fn parse(path: &str) -> Result<Self> {
        match path.split_once("://") {
            None => Ok(Location::Local(PathBuf::from(path))),
            Some(("file", rest)) => Ok(Location::Local(PathBuf::from(rest))),
            Some((scheme, rest)) if OBJECT_STORE_SCHEMES.contains(&scheme) => {
                let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
                if bucket.is_empty() {
                    return Err(Error::invalid_spec(format!("no bucket in `{}`", path)));
                }
                Ok(Location::Object {
                    scheme: scheme.to_string(),
                    bucket: bucket.to_string(),
                    key: key.trim_matches('/').to_string(),
                })
            }
            Some((scheme, _)) => Err(Error::StorageUnavailable {
                backend: scheme.to_string(),
            }),
        }
    }

    pub fn is_object_store(&self) -> bool {
        matches!(self, Location::Object { .. })
    }

    /// Child location `relative` below this one
    pub fn join(&self, relative: &str) -> Location {
        match self {
            Location::Local(path) => Location::Local(path.join(relative)),
            Location::Object {
                scheme,
                bucket,
                key,
            } => Location::Object {
                scheme: scheme.clone(),
                bucket: bucket.clone(),
                key: join_key(key, relative),
            },
        }
    }

    /// Enclosing location, if any
    pub fn parent(&self) -> Option<Location> {
        match self {
            Location::Local(path) => path.parent().map(|p| Location::Local(p.to_path_buf())),
            Location::Object {
                scheme,
                bucket,
                key,
            } => {
                if key.is_empty() {
                    return None;
                }
                let parent = key.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
                Some(Location::Object {
                    scheme: scheme.clone(),
                    bucket: bucket.clone(),
                    key: parent.to_string(),
                })
            }
        }
    }

    /// Last path component
    pub fn file_name(&self) -> Option<String> {
        match self {
            Location::Local(path) => path.file_name().map(|n| n.to_string_lossy().to_string()),
            Location::Object { key, .. } => key
                .rsplit('/')
                .next()
                .filter(|n| !n.is_empty())
                .map(str::to_string),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Local(path) => write!(f, "{}", path.display()),
            Location::Object {
                scheme,
                bucket,
                key,
            } if key.is_empty() => write!(f, "{}://{}", scheme, bucket),
            Location::Object {
                scheme,
                bucket,
                key,
            } => write!(f, "{}://{}/{}", scheme, bucket, key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_object_store() {
        let loc = Location::parse("gs://bucket/runs/exp1/").unwrap();
        assert_eq!(
            loc,
            Location::Object {
                scheme: "gs".to_string(),
                bucket: "bucket".to_string(),
                key: "runs/exp1".to_string(),
            }
        );
        assert_eq!(loc.join("checkpoint_5").to_string(), "gs://bucket/runs/exp1/checkpoint_5");
        assert_eq!(loc.file_name().as_deref(), Some("exp1"));
        assert_eq!(loc.parent().unwrap().to_string(), "gs://bucket/runs");
    }

    #[test]
    fn test_parse_local_and_unknown() {
        assert_eq!(
            Location::parse("/tmp/ckpt").unwrap(),
            Location::Local(PathBuf::from("/tmp/ckpt"))
        );
        assert!(!Location::parse("file:///tmp/ckpt").unwrap().is_object_store());
        assert!(matches!(
            Location::parse("ftp://host/x"),
            Err(Error::StorageUnavailable { .. })
        ));
        assert!(Location::parse("s3://").is_err());
    }

    #[test]
    fn test_is_object_store_path() {
        assert!(is_object_store_path("s3://b/k"));
        assert!(is_object_store_path("mem://b"));
        assert!(!is_object_store_path("/data/s3://x"));
        assert!(!is_object_store_path("relative/dir"));
    }
}
