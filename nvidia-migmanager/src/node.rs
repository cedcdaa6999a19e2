//! The Kubernetes Node surface: label reads and writes, and a watcher that
//! feeds selected-config changes into the applier loop.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::watcher;
use log::{info, warn};
use snafu::ResultExt;

use crate::sync::SyncableValue;

pub struct NodeClient {
    client: kube::Client,
    node_name: String,
}

impl NodeClient {
    pub fn new(client: kube::Client, node_name: String) -> Self {
        Self { client, node_name }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    pub async fn labels(&self) -> Result<BTreeMap<String, String>> {
        let node = self
            .nodes()
            .get(&self.node_name)
            .await
            .context(error::GetNodeSnafu {
                node: &self.node_name,
            })?;
        Ok(node.metadata.labels.unwrap_or_default())
    }

    pub async fn get_label(&self, key: &str) -> Result<Option<String>> {
        Ok(self.labels().await?.get(key).cloned())
    }

    /// Merge-patch a single label onto the node.
    pub async fn set_label(&self, key: &str, value: &str) -> Result<()> {
        let patch = serde_json::json!({
            "metadata": {
                "labels": {
                    key: value,
                }
            }
        });
        self.nodes()
            .patch(
                &self.node_name,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
            .context(error::PatchNodeSnafu {
                node: &self.node_name,
                label: key,
            })?;
        Ok(())
    }

    pub async fn set_labels(&self, labels: &BTreeMap<String, String>) -> Result<()> {
        if labels.is_empty() {
            return Ok(());
        }
        let patch = serde_json::json!({
            "metadata": {
                "labels": labels,
            }
        });
        self.nodes()
            .patch(
                &self.node_name,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
            .context(error::PatchNodeSnafu {
                node: &self.node_name,
                label: "batch",
            })?;
        Ok(())
    }

    /// Watch this node and push every change of `key` into `sink`. Runs
    /// until the process exits; watch errors are logged and the watch
    /// resumes.
    pub async fn watch_label(&self, key: &str, sink: Arc<SyncableValue<String>>) {
        let config =
            watcher::Config::default().fields(&format!("metadata.name={}", self.node_name));
        let mut stream = watcher(self.nodes(), config).boxed();
        let mut last: Option<String> = None;

        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::Apply(node)) | Ok(watcher::Event::InitApply(node)) => {
                    let value = node
                        .metadata
                        .labels
                        .as_ref()
                        .and_then(|labels| labels.get(key))
                        .cloned()
                        .unwrap_or_default();
                    if last.as_deref() != Some(value.as_str()) {
                        info!("observed {}={}", key, value);
                        last = Some(value.clone());
                        sink.set(value);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("node watch interrupted, resuming: {}", e),
            }
        }
    }
}

type Result<T, E = error::Error> = std::result::Result<T, E>;

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Unable to get node '{}': {}", node, source))]
        GetNode { node: String, source: kube::Error },

        #[snafu(display("Unable to patch label '{}' on node '{}': {}", label, node, source))]
        PatchNode {
            node: String,
            label: String,
            source: kube::Error,
        },
    }
}

pub use error::Error;
