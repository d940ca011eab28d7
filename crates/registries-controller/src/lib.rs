//! Registry certificate distribution controller
//!
//! Reconciles `Registry` resources by running one-shot jobs that copy the
//! registry CA into (or remove it from) every node's docker and podman trust
//! stores, and records what is confirmed installed in the Registry status.
//!
//! - [`job`] builds the per-node jobs and interprets their outcome
//! - [`installer`] and [`remover`] are the two certificate state machines
//! - [`controller`] is the reconciliation entry point and finalizer handling
//! - [`mappers`] translate Secret, Node and Job events into Registry keys

#![deny(missing_docs)]

pub mod controller;
pub mod finalizer;
pub mod installer;
pub mod job;
pub mod kube_client;
pub mod mappers;
pub mod reconciler;
pub mod remover;

#[cfg(test)]
mod test_support;

pub use controller::{error_policy, reconcile, Context, ControllerConfig};
pub use kube_client::{KubeClient, KubeClientImpl};
pub use reconciler::{CertDistributor, CertReconciler, ResolvedCertificate};
