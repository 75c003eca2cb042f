//! Finalizer manager
//!
//! The reconciler persists the finalizer and requeues before it creates any
//! child, so a crash between the two steps can never leave a child without
//! a finalizer recorded on its owner. Add and remove report whether they
//! changed anything; callers persist only on `true`.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::json;

/// Finalizer token placed on every langop resource
pub const FINALIZER: &str = "langop.io/finalizer";

/// True when the finalizer is present
pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == finalizer))
}

/// Add the finalizer; returns `false` when it was already present
pub fn add_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    if has_finalizer(meta, finalizer) {
        return false;
    }
    meta.finalizers
        .get_or_insert_with(Vec::new)
        .push(finalizer.to_string());
    true
}

/// Remove every occurrence of the finalizer; returns `false` when absent
pub fn remove_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    let Some(finalizers) = meta.finalizers.as_mut() else {
        return false;
    };
    let before = finalizers.len();
    finalizers.retain(|f| f != finalizer);
    finalizers.len() != before
}

/// Merge patch persisting `meta`'s finalizer list
///
/// Carries the resource version so a concurrent writer turns into a 409
/// conflict (retried) instead of a lost update.
pub fn finalizers_patch(meta: &ObjectMeta) -> serde_json::Value {
    let finalizers = meta.finalizers.clone().unwrap_or_default();
    match &meta.resource_version {
        Some(rv) => json!({
            "metadata": { "finalizers": finalizers, "resourceVersion": rv }
        }),
        None => json!({ "metadata": { "finalizers": finalizers } }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_idempotent() {
        let mut meta = ObjectMeta::default();
        assert!(add_finalizer(&mut meta, FINALIZER));
        assert!(!add_finalizer(&mut meta, FINALIZER));
        assert_eq!(meta.finalizers.as_ref().unwrap().len(), 1);
        assert!(has_finalizer(&meta, FINALIZER));
    }

    #[test]
    fn remove_is_idempotent_and_keeps_foreign_finalizers() {
        let mut meta = ObjectMeta {
            finalizers: Some(vec![
                "example.com/other".to_string(),
                FINALIZER.to_string(),
            ]),
            ..Default::default()
        };
        assert!(remove_finalizer(&mut meta, FINALIZER));
        assert!(!remove_finalizer(&mut meta, FINALIZER));
        assert_eq!(
            meta.finalizers.as_deref(),
            Some(&["example.com/other".to_string()][..])
        );
    }

    #[test]
    fn remove_collapses_duplicates() {
        let mut meta = ObjectMeta {
            finalizers: Some(vec![FINALIZER.to_string(), FINALIZER.to_string()]),
            ..Default::default()
        };
        assert!(remove_finalizer(&mut meta, FINALIZER));
        assert!(!has_finalizer(&meta, FINALIZER));
    }

    #[test]
    fn remove_on_missing_list() {
        let mut meta = ObjectMeta::default();
        assert!(!remove_finalizer(&mut meta, FINALIZER));
    }

    #[test]
    fn patch_carries_resource_version() {
        let mut meta = ObjectMeta {
            resource_version: Some("42".to_string()),
            ..Default::default()
        };
        add_finalizer(&mut meta, FINALIZER);
        let patch = finalizers_patch(&meta);
        assert_eq!(patch["metadata"]["resourceVersion"], "42");
        assert_eq!(patch["metadata"]["finalizers"][0], FINALIZER);

        meta.resource_version = None;
        remove_finalizer(&mut meta, FINALIZER);
        let patch = finalizers_patch(&meta);
        assert!(patch["metadata"].get("resourceVersion").is_none());
        assert_eq!(patch["metadata"]["finalizers"], json!([]));
    }
}
