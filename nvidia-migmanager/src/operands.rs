//! Quiesce and restore of the GPU Operator operands around a reconfigure:
//! pause their deploy labels, wait for their pods to leave the node, and
//! delete validator pods so validations re-run afterwards.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams};
use log::{debug, info};
use snafu::ResultExt;

use crate::node::NodeClient;

const POD_WAIT_TIMEOUT: Duration = Duration::from_secs(300);
const POD_WAIT_INTERVAL: Duration = Duration::from_secs(5);

/// The deploy label key for an operand.
pub fn deploy_label(operand: &str) -> String {
    format!("{}{}", constants::GPU_DEPLOY_LABEL_PREFIX, operand)
}

/// The value to set while quiescing. An operator-forced `false` stays
/// `false`.
pub fn pause_value(current: &str) -> &'static str {
    if current == constants::OPERAND_DISABLED {
        constants::OPERAND_DISABLED
    } else {
        constants::OPERAND_PAUSED
    }
}

/// The value to restore afterwards. A remembered `false` stays `false`.
pub fn restore_value(remembered: &str) -> &'static str {
    if remembered == constants::OPERAND_DISABLED {
        constants::OPERAND_DISABLED
    } else {
        constants::OPERAND_ENABLED
    }
}

pub struct OperandManager {
    client: kube::Client,
    namespace: String,
    node_name: String,
}

impl OperandManager {
    pub fn new(client: kube::Client, namespace: String, node_name: String) -> Self {
        Self {
            client,
            namespace,
            node_name,
        }
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Remember the current operand deploy labels, then pause them.
    /// Returns the remembered values for the later restore.
    pub async fn pause(&self, node: &NodeClient) -> Result<BTreeMap<String, String>> {
        let labels = node.labels().await.context(error::NodeSnafu)?;

        let mut remembered = BTreeMap::new();
        let mut updates = BTreeMap::new();
        for operand in constants::GPU_OPERANDS {
            let key = deploy_label(operand);
            if let Some(current) = labels.get(&key) {
                remembered.insert(operand.to_string(), current.clone());
                updates.insert(key, pause_value(current).to_string());
            }
        }
        info!("pausing operands: {:?}", remembered.keys());
        node.set_labels(&updates).await.context(error::NodeSnafu)?;
        Ok(remembered)
    }

    /// Restore operand deploy labels from the remembered values.
    pub async fn restore(
        &self,
        node: &NodeClient,
        remembered: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut updates = BTreeMap::new();
        for (operand, value) in remembered {
            updates.insert(deploy_label(operand), restore_value(value).to_string());
        }
        info!("restoring operands: {:?}", remembered.keys());
        node.set_labels(&updates).await.context(error::NodeSnafu)
    }

    /// Wait for the paused operands' pods to disappear from this node.
    pub async fn wait_for_pods_gone(&self, paused: &BTreeMap<String, String>) -> Result<()> {
        let deadline = tokio::time::Instant::now() + POD_WAIT_TIMEOUT;
        for (operand, selector) in constants::OPERAND_POD_SELECTORS {
            if !paused.contains_key(*operand) {
                continue;
            }
            loop {
                let remaining = self.pods_on_node(selector).await?;
                if remaining == 0 {
                    debug!("no {} pods left on the node", operand);
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    return error::PodWaitTimeoutSnafu {
                        operand: *operand,
                        remaining,
                    }
                    .fail();
                }
                debug!("waiting for {} {} pods to terminate", remaining, operand);
                tokio::time::sleep(POD_WAIT_INTERVAL).await;
            }
        }
        Ok(())
    }

    async fn pods_on_node(&self, selector: &str) -> Result<usize> {
        let params = ListParams::default()
            .labels(selector)
            .fields(&format!("spec.nodeName={}", self.node_name));
        let pods = self
            .pods()
            .list(&params)
            .await
            .context(error::ListPodsSnafu { selector })?;
        Ok(pods.items.len())
    }

    /// Delete the device-plugin and CUDA validator pods on this node.
    pub async fn delete_validator_pods(&self) -> Result<()> {
        self.delete_pods(constants::PLUGIN_VALIDATOR_LABEL).await?;
        self.delete_pods(constants::CUDA_VALIDATOR_LABEL).await
    }

    /// Delete the operator validator pod so validations re-run against the
    /// new layout.
    pub async fn delete_operator_validator_pods(&self) -> Result<()> {
        self.delete_pods(constants::OPERATOR_VALIDATOR_LABEL).await
    }

    async fn delete_pods(&self, selector: &str) -> Result<()> {
        let params = ListParams::default()
            .labels(selector)
            .fields(&format!("spec.nodeName={}", self.node_name));
        self.pods()
            .delete_collection(&DeleteParams::default(), &params)
            .await
            .context(error::DeletePodsSnafu { selector })?;
        Ok(())
    }
}

type Result<T, E = error::Error> = std::result::Result<T, E>;

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("{}", source))]
        Node { source: crate::node::Error },

        #[snafu(display("Unable to list pods matching '{}': {}", selector, source))]
        ListPods {
            selector: String,
            source: kube::Error,
        },

        #[snafu(display("Unable to delete pods matching '{}': {}", selector, source))]
        DeletePods {
            selector: String,
            source: kube::Error,
        },

        #[snafu(display(
            "Timed out waiting for {} {} pods to leave the node",
            remaining,
            operand
        ))]
        PodWaitTimeout { operand: String, remaining: usize },
    }
}

pub use error::Error;

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

#[cfg(test)]
mod test {
    use super::*;
    use test_case::test_case;

    #[test]
    fn deploy_labels_carry_the_prefix() {
        assert_eq!(
            deploy_label("device-plugin"),
            "nvidia.com/gpu.deploy.device-plugin"
        );
    }

    #[test_case("true", "paused-for-mig-change"; "enabled pauses")]
    #[test_case("paused-for-mig-change", "paused-for-mig-change"; "paused stays paused")]
    #[test_case("false", "false"; "forced off stays off")]
    fn pause_values(current: &str, expected: &str) {
        assert_eq!(pause_value(current), expected);
    }

    #[test_case("true", "true"; "enabled returns")]
    #[test_case("paused-for-mig-change", "true"; "paused returns")]
    #[test_case("false", "false"; "forced off stays off")]
    fn restore_values(remembered: &str, expected: &str) {
        assert_eq!(restore_value(remembered), expected);
    }
}
