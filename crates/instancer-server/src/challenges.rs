// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Challenge image configuration.
//!
//! Challenges arrive in loose shapes (a JSON object, a packed
//! `image:tag` string, or a bare port number) and are normalized to a
//! [`ChallengeConfig`] before anything touches the cluster.

use std::collections::HashMap;
use std::io;
use std::path::Path;

use serde_json::Value;

/// Normalized image configuration for one challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeConfig {
    /// Image reference without a tag.
    pub image: String,
    /// Image tag, when one was given.
    pub tag: Option<String>,
    /// Exposed container port, when one was given.
    pub port: Option<i32>,
}

/// Source of challenge configuration, keyed by challenge id.
pub trait ChallengeSource: Send + Sync {
    /// Look up the configuration for a challenge.
    fn lookup(&self, challenge_id: i64) -> Option<ChallengeConfig>;
}

/// Fixed in-memory challenge table.
#[derive(Debug, Default)]
pub struct StaticChallengeSource {
    challenges: HashMap<i64, ChallengeConfig>,
}

impl StaticChallengeSource {
    /// An empty source that knows no challenges.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a source from explicit entries.
    pub fn new(entries: impl IntoIterator<Item = (i64, ChallengeConfig)>) -> Self {
        Self {
            challenges: entries.into_iter().collect(),
        }
    }

    /// Load a source from a JSON file mapping challenge ids to either
    /// an object (`{"image": .., "tag": .., "port": ..}`) or a packed
    /// connection string.
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let parsed: HashMap<String, Value> = serde_json::from_str(&raw)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut challenges = HashMap::new();
        for (key, value) in parsed {
            let id: i64 = key.parse().map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("challenge key is not an integer: {key}"),
                )
            })?;
            let config = unpack_connection_info(&value).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("challenge {id} has no usable connection info"),
                )
            })?;
            challenges.insert(id, config);
        }
        Ok(Self { challenges })
    }
}

impl ChallengeSource for StaticChallengeSource {
    fn lookup(&self, challenge_id: i64) -> Option<ChallengeConfig> {
        self.challenges.get(&challenge_id).cloned()
    }
}

/// Split an image reference into (image, tag).
///
/// A `://` anywhere means the value is a URL-ish reference and is left
/// whole. Otherwise the last colon counts as a tag separator only when
/// it comes after the last slash, so registry ports survive:
/// `registry.local:5000/app:v2` splits into `registry.local:5000/app`
/// and `v2`.
pub fn split_image_tag(reference: &str) -> (String, Option<String>) {
    if reference.contains("://") {
        return (reference.to_string(), None);
    }
    let last_slash = reference.rfind('/');
    match reference.rfind(':') {
        Some(colon) if last_slash.is_none_or(|slash| colon > slash) => (
            reference[..colon].to_string(),
            Some(reference[colon + 1..].to_string()),
        ),
        _ => (reference.to_string(), None),
    }
}

/// Parse a port value out of a JSON number or string. Anything outside
/// 1..=65535 is rejected.
pub fn parse_port(value: &Value) -> Option<i32> {
    let port = match value {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    (1..=65535).contains(&port).then_some(port as i32)
}

/// Normalize loose connection info into a [`ChallengeConfig`].
///
/// A JSON object is read field-wise. A string is first tried as a JSON
/// object packed into the string itself (the format legacy rows carry);
/// failing that, a bare integer is a port with no image and yields
/// nothing to deploy, and anything else is a packed `image[:tag]`
/// reference.
pub fn unpack_connection_info(raw: &Value) -> Option<ChallengeConfig> {
    if let Value::Object(fields) = raw {
        let image = fields.get("image")?.as_str()?.to_string();
        let tag = fields
            .get("tag")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        let port = fields.get("port").and_then(parse_port);
        return Some(ChallengeConfig { image, tag, port });
    }

    let packed = match raw {
        Value::String(s) => s.trim(),
        Value::Number(_) => return None,
        _ => return None,
    };
    if packed.is_empty() {
        return None;
    }
    // Legacy rows pack the whole object into the string.
    if let Ok(inner) = serde_json::from_str::<Value>(packed)
        && inner.is_object()
    {
        return unpack_connection_info(&inner);
    }
    // A packed string that is just digits is a port, not an image.
    if packed.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (image, tag) = split_image_tag(packed);
    Some(ChallengeConfig {
        image,
        tag,
        port: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn split_keeps_registry_port() {
        assert_eq!(
            split_image_tag("registry.local:5000/app:v2"),
            ("registry.local:5000/app".to_string(), Some("v2".to_string()))
        );
        assert_eq!(
            split_image_tag("registry.local:5000/app"),
            ("registry.local:5000/app".to_string(), None)
        );
    }

    #[test]
    fn split_handles_plain_and_url_references() {
        assert_eq!(
            split_image_tag("nginx:1.27"),
            ("nginx".to_string(), Some("1.27".to_string()))
        );
        assert_eq!(split_image_tag("nginx"), ("nginx".to_string(), None));
        assert_eq!(
            split_image_tag("oci://registry/app:v1"),
            ("oci://registry/app:v1".to_string(), None)
        );
    }

    #[test]
    fn ports_are_range_checked() {
        assert_eq!(parse_port(&json!(8080)), Some(8080));
        assert_eq!(parse_port(&json!("443")), Some(443));
        assert_eq!(parse_port(&json!(0)), None);
        assert_eq!(parse_port(&json!(70000)), None);
        assert_eq!(parse_port(&json!("not a port")), None);
    }

    #[test]
    fn unpack_prefers_object_fields() {
        let config = unpack_connection_info(&json!({
            "image": "ctf/web",
            "tag": "latest",
            "port": "3000",
        }))
        .unwrap();
        assert_eq!(config.image, "ctf/web");
        assert_eq!(config.tag.as_deref(), Some("latest"));
        assert_eq!(config.port, Some(3000));
    }

    #[test]
    fn unpack_decodes_json_packed_into_a_string() {
        let config =
            unpack_connection_info(&json!(r#"{"image": "nginx", "tag": "1.25", "port": 80}"#))
                .unwrap();
        assert_eq!(config.image, "nginx");
        assert_eq!(config.tag.as_deref(), Some("1.25"));
        assert_eq!(config.port, Some(80));

        // A JSON object without an image still yields nothing to deploy.
        assert!(unpack_connection_info(&json!(r#"{"port": 1337}"#)).is_none());
    }

    #[test]
    fn unpack_handles_packed_strings_and_bare_ports() {
        let config = unpack_connection_info(&json!("ctf/pwn:v3")).unwrap();
        assert_eq!(config.image, "ctf/pwn");
        assert_eq!(config.tag.as_deref(), Some("v3"));
        assert_eq!(config.port, None);

        // Port-only info has no image to deploy.
        assert!(unpack_connection_info(&json!(1337)).is_none());
        assert!(unpack_connection_info(&json!("1337")).is_none());
        assert!(unpack_connection_info(&json!("")).is_none());
    }

    #[test]
    fn file_loader_accepts_objects_and_packed_strings() {
        let dir = std::env::temp_dir().join(format!("challenges-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("challenges.json");
        std::fs::write(
            &path,
            r#"{"1": {"image": "ctf/web", "port": 8080}, "2": "ctf/pwn:v3"}"#,
        )
        .unwrap();

        let source = StaticChallengeSource::from_file(&path).unwrap();
        assert_eq!(source.lookup(1).unwrap().port, Some(8080));
        assert_eq!(source.lookup(2).unwrap().tag.as_deref(), Some("v3"));
        assert!(source.lookup(3).is_none());

        std::fs::remove_dir_all(&dir).ok();
    }
}
