//! Connectivity monitoring.

pub mod monitor;
pub mod probe;

pub use monitor::{
    ConnectivityEvent, MonitorOptions, NetworkMonitor, NetworkSnapshot, NetworkState,
    SubscriptionId, Transport,
};
pub use probe::{MockProbe, ReachabilityProbe, TcpProbe};
