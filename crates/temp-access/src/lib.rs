//! # Temporary Kubernetes Access
//!
//! Short-lived, self-revoking access credentials for Kubernetes clusters.
//!
//! This crate provides:
//! - A service account per grant, bound to the built-in `view` role or to a
//!   custom read-only cluster role
//! - A bound token whose lifetime equals the requested time-to-live
//! - A deletion job that removes the grant once the time-to-live has passed,
//!   without any further involvement of the process that created it
//!
//! ## Architecture
//!
//! [`CredentialProvisioner`] drives every grant through a fixed sequence of
//! calls on a [`ClusterGateway`]:
//! - [`KubeGateway`] talks to a real API server using a kubeconfig
//! - [`MemoryGateway`] keeps everything in process with a manual clock
//!
//! The deletion job runs as a janitor service account that may delete only
//! the objects of its own grant.

pub mod cleanup;
pub mod config;
mod duration;
mod error;
pub mod gateway;
pub mod naming;
pub mod permissions;
mod provisioner;

pub use cleanup::{CleanupAction, CleanupUnitBuilder, ScheduledUnitSpec};
pub use config::AccessConfig;
pub use duration::{format_duration, parse_duration};
pub use error::{AccessError, ConfigError, GatewayError, GatewayResult, ProvisionStep, Result};
pub use gateway::{
    Binding, ClusterGateway, Identity, KubeGateway, Kubeconfig, MemoryGateway, ObjectKind,
    ObjectRef, ObjectUid, OwnerReference, PermissionSet,
};
pub use naming::GrantNames;
pub use permissions::{PolicyRule, RoleChoice};
pub use provisioner::{CredentialProvisioner, IssuedGrant, ProvisionerConfig, ScopeOutcome};
