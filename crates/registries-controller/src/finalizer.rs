//! Finalizer protocol
//!
//! A Registry keeps [`REGISTRY_FINALIZER`] until the certificate has been
//! removed from every node. Completing the finalizer only edits the object in
//! memory; the entry point persists it after the status.

use kube::ResourceExt;

use registries_common::crd::Registry;
use registries_common::kube_utils::has_finalizer;
use registries_common::REGISTRY_FINALIZER;

/// Deletion is pending and we still hold the finalizer
pub fn is_finalizing(registry: &Registry) -> bool {
    registry.is_deleting() && has_finalizer(registry, REGISTRY_FINALIZER)
}

/// Drop the finalizer so the pending deletion can proceed.
///
/// # Panics
///
/// When the Registry is not being deleted. Reaching this without a pending
/// deletion is a bug in the caller and must never happen in correct operation.
pub fn finalizer_done(registry: &mut Registry) {
    assert!(
        registry.is_deleting(),
        "finalizer completion requested for registry {} which is not being deleted",
        registry.name_any()
    );
    if let Some(finalizers) = registry.metadata.finalizers.as_mut() {
        finalizers.retain(|f| f != REGISTRY_FINALIZER);
    }
}
