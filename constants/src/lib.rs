/*!
Constants shared between the `mig-parted` CLI and the `nvidia-migmanager`
node controller: Kubernetes label keys, GPU Operator operand names, and
well-known host paths.
*/

// Node labels read and written by the controller.
pub const MIG_CONFIG_LABEL: &str = "nvidia.com/mig.config";
pub const MIG_CONFIG_STATE_LABEL: &str = "nvidia.com/mig.config.state";

// Values taken by the state label.
pub const MIG_CONFIG_STATE_PENDING: &str = "pending";
pub const MIG_CONFIG_STATE_REBOOTING: &str = "rebooting";
pub const MIG_CONFIG_STATE_SUCCESS: &str = "success";
pub const MIG_CONFIG_STATE_FAILED: &str = "failed";

// GPU Operator operands quiesced around a reconfigure. The deploy label for
// operand `x` is `nvidia.com/gpu.deploy.x`.
pub const GPU_DEPLOY_LABEL_PREFIX: &str = "nvidia.com/gpu.deploy.";
pub const GPU_OPERANDS: &[&str] = &[
    "device-plugin",
    "gpu-feature-discovery",
    "dcgm-exporter",
    "dcgm",
    "nvsm",
];

// Pod selectors for each operand's per-node pods.
pub const OPERAND_POD_SELECTORS: &[(&str, &str)] = &[
    ("device-plugin", "app=nvidia-device-plugin-daemonset"),
    ("gpu-feature-discovery", "app=gpu-feature-discovery"),
    ("dcgm-exporter", "app=nvidia-dcgm-exporter"),
    ("dcgm", "app=nvidia-dcgm"),
    ("nvsm", "app=nvidia-nvsm"),
];

// Values taken by operand deploy labels.
pub const OPERAND_ENABLED: &str = "true";
pub const OPERAND_DISABLED: &str = "false";
pub const OPERAND_PAUSED: &str = "paused-for-mig-change";

// Validator pods deleted so validations re-run after a reconfigure.
pub const PLUGIN_VALIDATOR_LABEL: &str = "app=nvidia-device-plugin-validator";
pub const CUDA_VALIDATOR_LABEL: &str = "app=nvidia-cuda-validator";
pub const OPERATOR_VALIDATOR_LABEL: &str = "app=nvidia-operator-validator";

// Environment key persisted to the host so a reboot resurfaces the same
// selection.
pub const SELECTED_CONFIG_ENV: &str = "MIG_PARTED_SELECTED_CONFIG";

// Host-side state kept by the controller.
pub const DEFAULT_HOST_ROOT_MOUNT: &str = "/host";
pub const DEFAULT_STATE_DIR: &str = "/var/lib/nvidia-mig-manager";
pub const REBOOT_SENTINEL_FILE: &str = "reboot_attempted";

pub const DEFAULT_GPU_CLIENTS_NAMESPACE: &str = "gpu-operator";

// Management CDI spec written after a reconfigure when CDI is enabled.
pub const CDI_SPEC_DIR: &str = "/var/run/cdi";
pub const CDI_MANAGEMENT_SPEC_FILE: &str = "management.nvidia.com-gpu.yaml";
pub const CDI_MANAGEMENT_VENDOR: &str = "management.nvidia.com";
pub const CDI_MANAGEMENT_CLASS: &str = "gpu";
