// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Label and annotation conventions for managed resources.
//!
//! Every workload and endpoint this system provisions carries the
//! `component=user-instance` marker plus `user_id`/`challenge_id` ownership
//! labels, and an `app={name}` label used as the workload selector and for
//! pod lookup. Lifetime timestamps live in workload annotations as
//! stringified whole-second Unix epoch integers.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::orchestrator::Owner;

/// Marker label key identifying resources managed by this system.
pub const COMPONENT_LABEL: &str = "component";
/// Marker label value identifying resources managed by this system.
pub const COMPONENT_VALUE: &str = "user-instance";
/// Label key holding the owning user id.
pub const USER_LABEL: &str = "user_id";
/// Label key holding the owning challenge id.
pub const CHALLENGE_LABEL: &str = "challenge_id";
/// Label key tying an instance's pods and endpoint to its workload.
pub const APP_LABEL: &str = "app";

/// Annotation holding the creation timestamp.
pub const CREATED_AT_ANNOTATION: &str = "created_at";
/// Annotation holding the last time the instance was seen or extended.
pub const LAST_SEEN_ANNOTATION: &str = "last_seen";
/// Annotation holding the expiry timestamp.
pub const EXPIRES_AT_ANNOTATION: &str = "expires_at";

/// Generate a fresh instance name for an owner.
///
/// The random suffix keeps names collision-free without a central
/// allocator; the embedded user/challenge ids make resources legible when
/// inspecting the cluster directly.
pub fn instance_name(owner: &Owner) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "ctf-u{}-c{}-{}",
        owner.user_id,
        owner.challenge_id,
        &suffix[..6]
    )
}

/// Labels stamped on both resources of an instance.
pub fn instance_labels(owner: &Owner, name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (COMPONENT_LABEL.to_string(), COMPONENT_VALUE.to_string()),
        (USER_LABEL.to_string(), owner.user_id.to_string()),
        (CHALLENGE_LABEL.to_string(), owner.challenge_id.to_string()),
        (APP_LABEL.to_string(), name.to_string()),
    ])
}

/// Selector matching every instance belonging to an owner.
pub fn owner_selector(owner: &Owner) -> String {
    format!(
        "{COMPONENT_LABEL}={COMPONENT_VALUE},{USER_LABEL}={},{CHALLENGE_LABEL}={}",
        owner.user_id, owner.challenge_id
    )
}

/// Selector matching every resource managed by this system.
pub fn component_selector() -> String {
    format!("{COMPONENT_LABEL}={COMPONENT_VALUE}")
}

/// Selector matching the pods backing one instance.
pub fn app_selector(name: &str) -> String {
    format!("{APP_LABEL}={name}")
}

/// Read an integer annotation, tolerating absent or malformed values.
pub fn annotation_i64(meta: &ObjectMeta, key: &str) -> Option<i64> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> Owner {
        Owner {
            user_id: 1,
            challenge_id: 7,
        }
    }

    #[test]
    fn name_embeds_owner_and_random_suffix() {
        let a = instance_name(&owner());
        let b = instance_name(&owner());
        assert!(a.starts_with("ctf-u1-c7-"));
        assert_eq!(a.len(), "ctf-u1-c7-".len() + 6);
        assert_ne!(a, b);
    }

    #[test]
    fn owner_selector_format() {
        assert_eq!(
            owner_selector(&owner()),
            "component=user-instance,user_id=1,challenge_id=7"
        );
    }

    #[test]
    fn annotation_parsing_tolerates_garbage() {
        let meta = ObjectMeta {
            annotations: Some(BTreeMap::from([
                ("created_at".to_string(), "1000".to_string()),
                ("expires_at".to_string(), "not-a-number".to_string()),
            ])),
            ..Default::default()
        };
        assert_eq!(annotation_i64(&meta, CREATED_AT_ANNOTATION), Some(1000));
        assert_eq!(annotation_i64(&meta, EXPIRES_AT_ANNOTATION), None);
        assert_eq!(annotation_i64(&meta, LAST_SEEN_ANNOTATION), None);
    }
}
