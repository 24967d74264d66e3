use miette::Diagnostic;
use thiserror::Error;

/// Error type for plugin socket operations
#[derive(Error, Debug, Diagnostic)]
pub enum DockervolError {
    /// Transport-level failure: dial, I/O, timeout, or a non-2xx
    /// status from the plugin endpoint.
    #[error("plugin transport failure: {message}")]
    #[diagnostic(
        code(remora::dockervol::transport),
        help("Verify the plugin socket path exists and the plugin is running")
    )]
    Transport {
        #[allow(unused)]
        message: String,
    },

    /// The plugin answered but reported a logical failure in its
    /// `Err` field.
    #[error("plugin driver error: {message}")]
    #[diagnostic(code(remora::dockervol::driver))]
    Driver {
        #[allow(unused)]
        message: String,
    },

    /// A named V2 plugin was found in the catalog but is disabled.
    /// The resolved socket path is carried for diagnostics.
    #[error("docker V2 plugin '{name}' is disabled (socket {socket_path})")]
    #[diagnostic(
        code(remora::dockervol::plugin_disabled),
        help("Enable the plugin with `docker plugin enable {name}`")
    )]
    PluginDisabled {
        #[allow(unused)]
        name: String,
        #[allow(unused)]
        socket_path: String,
    },

    /// No V2 plugin with the requested name exists in the catalog.
    #[error("unable to find docker V2 plugin named '{name}'")]
    #[diagnostic(
        code(remora::dockervol::plugin_not_found),
        help("Check `docker plugin ls` for the installed plugin names")
    )]
    PluginNotFound {
        #[allow(unused)]
        name: String,
    },

    /// A volume name was required but empty.
    #[error("volume name is required")]
    #[diagnostic(code(remora::dockervol::missing_name))]
    MissingName,
}

/// Result type alias for plugin socket operations
pub type Result<T> = std::result::Result<T, DockervolError>;

impl DockervolError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn driver(message: impl Into<String>) -> Self {
        Self::Driver {
            message: message.into(),
        }
    }
}
