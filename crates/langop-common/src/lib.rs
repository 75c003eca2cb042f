//! Common types for langop: CRDs, errors, conditions, finalizers and utilities

#![deny(missing_docs)]

pub mod conditions;
pub mod crd;
pub mod error;
pub mod finalizer;
pub mod kube_utils;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of every langop resource
pub const API_GROUP: &str = "langop.io";

/// Field manager used for status writes
pub const FIELD_MANAGER: &str = "langop-operator";

/// Namespace scanned for CNI signatures and hosting cluster DNS
pub const SYSTEM_NAMESPACE: &str = "kube-system";

/// Standard name label
pub const LABEL_NAME: &str = "app.kubernetes.io/name";

/// Standard managed-by label
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of the managed-by label on everything langop creates
pub const LABEL_MANAGED_BY_LANGOP: &str = "language-operator";

/// Standard part-of label
pub const LABEL_PART_OF: &str = "app.kubernetes.io/part-of";

/// Value of the part-of label on everything langop creates
pub const LABEL_PART_OF_LANGOP: &str = "langop";

/// Kind of the langop resource owning a child
pub const LABEL_KIND: &str = "langop.io/kind";

/// Cluster a member resource belongs to
pub const LABEL_CLUSTER: &str = "langop.io/cluster";

/// Group label matched by `group` network peers
pub const LABEL_GROUP: &str = "langop.io/group";
