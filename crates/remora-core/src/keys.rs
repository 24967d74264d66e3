//! Annotation and option keys shared across the workspace.

/// Annotation the cluster uses to mark who provisioned a volume.
pub const PROVISIONED_BY: &str = "pv.kubernetes.io/provisioned-by";

/// Legacy storage-class annotation still written by older clusters.
pub const BETA_STORAGE_CLASS: &str = "volume.beta.kubernetes.io/storage-class";

/// Suffix of the per-claim annotation naming the backing plugin volume.
/// The full key is `<provisioner>/docker-volume-name`.
pub const DOCKER_VOLUME_NAME: &str = "docker-volume-name";

/// Option key carrying the manager tag on plugin volumes.
pub const MANAGER: &str = "manager";

/// Manager tag this provisioner stamps on plugin volumes it owns.
pub const MANAGER_NAME: &str = "k8s";

/// Class parameter listing claim-annotation overrides, comma separated.
pub const ALLOW_OVERRIDES: &str = "allowOverrides";

/// Option key the plugin understands for volume cloning.
pub const CLONE_OF: &str = "cloneOf";

/// Class parameter naming a source claim to clone; resolved to
/// [`CLONE_OF`] before the options reach the plugin.
pub const CLONE_OF_PVC: &str = "cloneOfPVC";

/// Reserved orchestrator prefix; options starting with this are
/// stripped before create/update when the driver config asks for it.
pub const K8S_OPTION_PREFIX: &str = "kubernetes.io";

/// Directory the orchestrator keeps flexvolume plugins (and our
/// side-car driver configs) under.
pub const FLEXVOLUME_BASE_PATH: &str = "/usr/libexec/kubernetes/kubelet-plugins/volume/exec/";
