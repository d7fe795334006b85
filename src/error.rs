//! Error types for the uplink audio stack

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Transport write error: {0}")]
    Transport(#[from] TransportError),

    #[error("Initialization error: {0}")]
    Init(#[from] InitError),

    #[error("Audio graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Malformed or missing configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Illegal audio device specification ({0}). Should be <type>:<ip-addr>:<port>")]
    InvalidSpecifier(String),

    #[error("Invalid address '{addr}' in device specification {spec}")]
    InvalidAddress { spec: String, addr: String },

    #[error("Invalid port '{port}' in device specification {spec}")]
    InvalidPort { spec: String, port: String },

    #[error("Device specification {spec} needs {what} for mode {mode}")]
    MissingEndpoint {
        spec: String,
        what: &'static str,
        mode: &'static str,
    },

    #[error("Unknown audio device type '{0}'")]
    UnknownDeviceType(String),

    #[error("Config variable {section}/{key} not set")]
    MissingKey { section: String, key: String },

    #[error("Config variable {section}/{key} has an invalid value: {value}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

/// Socket level failures while opening a device
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Could not create UDP socket for {spec}: {source}")]
    SocketCreate {
        spec: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not bind UDP socket for {spec} to port {port}: {source}")]
    Bind {
        spec: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Device {0} is not open for writing")]
    NotWritable(String),
}

/// Send failures on the write path
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Send to {dest} failed: {source}")]
    SendFailed {
        dest: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Short send to {dest}: {sent} of {expected} bytes")]
    ShortSend {
        dest: std::net::SocketAddr,
        sent: usize,
        expected: usize,
    },
}

/// Sub-component construction failures in the uplink router
#[derive(Error, Debug)]
pub enum InitError {
    #[error("Could not initialize uplink transmitter {name}: {reason}")]
    Transmitter { name: String, reason: String },

    #[error("Could not initialize uplink receiver {name}: {reason}")]
    Receiver { name: String, reason: String },

    #[error("Uplink {0} is already initialized")]
    AlreadyActive(String),
}

/// Audio graph wiring errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Unknown stage {0}")]
    UnknownStage(usize),

    #[error("Stage {0} already has a consumer")]
    AlreadyConnected(usize),

    #[error("Stage {0} cannot have a consumer")]
    NotAProducer(usize),

    #[error("Stage {0} cannot be written to directly")]
    NotAConsumer(usize),

    #[error("Connecting stage {0} would create a cycle")]
    Cycle(usize),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
