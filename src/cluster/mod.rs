//! Kubernetes cluster image enumeration.
//!
//! [`ClusterImageSource`] lists the raw image references used by workloads in
//! one cluster context. [`KubectlImageSource`] implements it with `kubectl`,
//! reading pods, replica sets and controller revisions so that images of
//! scaled-down deployments and previous stateful set revisions count as used.

mod kubectl;

pub use kubectl::{KubectlImageSource, images_from_list};

use crate::Result;

/// Lists image references running in a cluster.
pub trait ClusterImageSource {
    /// Returns every image reference used in `context`, in discovery order.
    ///
    /// `None` selects the current context of the kubeconfig. References are
    /// returned verbatim and may repeat.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster cannot be queried; an incomplete view of
    /// cluster usage must never be treated as complete.
    fn list_images(&self, context: Option<&str>) -> Result<Vec<String>>;
}
