//! `kubectl`-backed cluster image source.

use super::ClusterImageSource;
use crate::{Error, Result};
use k8s_openapi::Resource;
use k8s_openapi::api::apps::v1::{ControllerRevision, ReplicaSet};
use k8s_openapi::api::core::v1::{Pod, PodSpec, PodTemplateSpec};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Command;
use tracing::{debug, instrument, trace};

/// Resource kinds whose pod templates reference images.
const RESOURCES: &str = "pods,replicasets,controllerrevisions";

/// A `kubectl get` result mixing several kinds.
#[derive(Debug, Deserialize)]
struct ResourceList {
    #[serde(default)]
    items: Vec<Value>,
}

fn parse_error(e: &serde_json::Error) -> Error {
    Error::OperationFailed {
        operation: "parse_kubectl_output".to_string(),
        cause: e.to_string(),
    }
}

fn typed<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| parse_error(&e))
}

fn push_pod_spec(images: &mut Vec<String>, spec: &PodSpec) {
    images.extend(
        spec.containers
            .iter()
            .chain(spec.init_containers.iter().flatten())
            .filter_map(|container| container.image.as_deref())
            .filter(|image| !image.is_empty())
            .map(str::to_string),
    );
}

fn push_template(images: &mut Vec<String>, template: Option<&PodTemplateSpec>) {
    if let Some(spec) = template.and_then(|t| t.spec.as_ref()) {
        push_pod_spec(images, spec);
    }
}

/// Pod template recorded in a controller revision, if any.
///
/// Revision data is an untyped patch of the owning workload; only its
/// `spec.template` is read.
fn revision_template(revision: &ControllerRevision) -> Result<Option<PodTemplateSpec>> {
    revision
        .data
        .as_ref()
        .and_then(|data| data.0.pointer("/spec/template"))
        .map(|template| typed(template.clone()))
        .transpose()
}

/// Extracts image references from `kubectl get ... -o json` output.
///
/// Pods contribute their own containers; replica sets and controller
/// revisions contribute the containers of their pod template. Items of other
/// kinds are ignored.
///
/// # Errors
///
/// Returns an error if the output is not a Kubernetes list or one of its
/// pods, replica sets or controller revisions is malformed.
pub fn images_from_list(json: &[u8]) -> Result<Vec<String>> {
    let list: ResourceList = serde_json::from_slice(json).map_err(|e| parse_error(&e))?;

    let mut images = Vec::new();
    for item in list.items {
        let kind = item
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if kind == Pod::KIND {
            let pod: Pod = typed(item)?;
            if let Some(spec) = &pod.spec {
                push_pod_spec(&mut images, spec);
            }
        } else if kind == ReplicaSet::KIND {
            let replica_set: ReplicaSet = typed(item)?;
            push_template(
                &mut images,
                replica_set.spec.as_ref().and_then(|s| s.template.as_ref()),
            );
        } else if kind == ControllerRevision::KIND {
            let revision: ControllerRevision = typed(item)?;
            push_template(&mut images, revision_template(&revision)?.as_ref());
        } else {
            trace!(kind = %kind, "Ignoring unexpected resource kind");
        }
    }

    Ok(images)
}

/// Lists cluster images by running `kubectl`.
#[derive(Debug, Clone)]
pub struct KubectlImageSource {
    program: String,
    kubeconfig: Option<PathBuf>,
}

impl Default for KubectlImageSource {
    fn default() -> Self {
        Self {
            program: "kubectl".to_string(),
            kubeconfig: None,
        }
    }
}

impl KubectlImageSource {
    /// Creates a source using `kubectl` from `PATH`.
    #[must_use]
    pub fn new(kubeconfig: Option<PathBuf>) -> Self {
        Self {
            kubeconfig,
            ..Self::default()
        }
    }

    /// Uses a different `kubectl` binary.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn command(&self, context: Option<&str>) -> Command {
        let mut command = Command::new(&self.program);
        if let Some(kubeconfig) = &self.kubeconfig {
            command.arg("--kubeconfig").arg(kubeconfig);
        }
        if let Some(context) = context {
            command.args(["--context", context]);
        }
        command.args(["get", RESOURCES, "--all-namespaces", "-o", "json"]);
        command
    }
}

impl ClusterImageSource for KubectlImageSource {
    #[instrument(skip(self), fields(operation = "list_images", backend = "kubectl"))]
    fn list_images(&self, context: Option<&str>) -> Result<Vec<String>> {
        let label = context.unwrap_or("<current>");
        trace!(context = label, "Fetching images from pods, replica sets and controller revisions");

        let output = self.command(context).output().map_err(|e| Error::OperationFailed {
            operation: "run_kubectl".to_string(),
            cause: format!("failed to run {}: {e}", self.program),
        })?;

        if !output.status.success() {
            return Err(Error::OperationFailed {
                operation: "run_kubectl".to_string(),
                cause: format!(
                    "context {label}: {} exited with {}: {}",
                    self.program,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        let images = images_from_list(&output.stdout)?;
        debug!(context = label, images = images.len(), "Listed cluster images");
        Ok(images)
    }
}
