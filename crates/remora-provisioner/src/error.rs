use miette::Diagnostic;
use thiserror::Error;

/// Error type for provisioning operations
#[derive(Error, Debug, Diagnostic)]
pub enum ProvisionerError {
    /// A chain can only run once
    #[error("this chain has already executed")]
    #[diagnostic(code(remora::provisioner::chain_already_executed))]
    ChainAlreadyExecuted,

    /// Runner names key the chain's output map and must be unique
    #[error("unable to build chain because runner names are not unique ({name})")]
    #[diagnostic(code(remora::provisioner::duplicate_runner))]
    DuplicateRunnerName {
        #[allow(unused)]
        name: String,
    },

    /// A runner needed the output of an earlier runner that is absent
    #[error("missing chain output '{name}'")]
    #[diagnostic(code(remora::provisioner::missing_chain_output))]
    MissingChainOutput {
        #[allow(unused)]
        name: String,
    },

    /// Cluster API request failed
    #[error("cluster request failed: {message}")]
    #[diagnostic(
        code(remora::provisioner::cluster),
        help("Check connectivity to the cluster API server")
    )]
    Cluster {
        #[allow(unused)]
        message: String,
    },

    /// No storage class with the requested name is cached
    #[error("unable to find a class named {name}")]
    #[diagnostic(code(remora::provisioner::class_not_found))]
    ClassNotFound {
        #[allow(unused)]
        name: String,
    },

    /// A referenced claim is not in the cache
    #[error("requested claim {namespace}/{name} was not found")]
    #[diagnostic(code(remora::provisioner::claim_not_found))]
    ClaimNotFound {
        #[allow(unused)]
        namespace: String,
        #[allow(unused)]
        name: String,
    },

    /// A clone source claim has no bound volume yet
    #[error("no volume found for claim {namespace}/{name}")]
    #[diagnostic(
        code(remora::provisioner::no_volume_for_claim),
        help("The clone source claim must be bound before it can be cloned")
    )]
    NoVolumeForClaim {
        #[allow(unused)]
        namespace: String,
        #[allow(unused)]
        name: String,
    },

    /// The claim did not bind to our volume before the deadline
    #[error("claim {claim} ({uid}) not bound after timeout")]
    #[diagnostic(code(remora::provisioner::bind_timeout))]
    BindTimeout {
        #[allow(unused)]
        claim: String,
        #[allow(unused)]
        uid: String,
    },

    /// The claim entered the lost phase while we were waiting
    #[error("claim {claim} was lost, reverting volume create ({uid})")]
    #[diagnostic(code(remora::provisioner::claim_lost))]
    ClaimLost {
        #[allow(unused)]
        claim: String,
        #[allow(unused)]
        uid: String,
    },

    /// The claim bound to a volume other than the one we made
    #[error("{message}")]
    #[diagnostic(code(remora::provisioner::bind_mismatch))]
    BindMismatch {
        #[allow(unused)]
        message: String,
    },

    /// A class provisioner id could not be split into vendor/driver
    #[error("unable to parse provisioner name {name}")]
    #[diagnostic(
        code(remora::provisioner::invalid_provisioner_name),
        help("Provisioner identifiers look like '<vendor>/<driver>'")
    )]
    InvalidProvisionerName {
        #[allow(unused)]
        name: String,
    },

    /// Driver side-car configuration could not be read
    #[error("unable to process driver config: {message}")]
    #[diagnostic(code(remora::provisioner::config))]
    Config {
        #[allow(unused)]
        message: String,
    },

    /// Volume plugin failure
    #[error(transparent)]
    #[diagnostic(transparent)]
    Dockervol(#[from] remora_dockervol::DockervolError),

    /// Internal error
    #[error("internal provisioner error: {message}")]
    #[diagnostic(code(remora::provisioner::internal))]
    Internal {
        #[allow(unused)]
        message: String,
    },
}

/// Result type alias for provisioning operations
pub type Result<T> = std::result::Result<T, ProvisionerError>;

impl ProvisionerError {
    pub fn cluster(message: impl Into<String>) -> Self {
        Self::Cluster {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}
