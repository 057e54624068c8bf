//! Transfer coordinator for dirdelta.
//!
//! A [`TransferCoordinator`] hosts an upload set and downloads
//! subdirectories from other coordinators, sending only the files whose
//! content differs. Packets travel over any [`Transport`]; the in-process
//! [`MemoryNetwork`] connects coordinators for tests and local mirroring.

mod config;
mod coordinator;
mod handles;
mod receiver;
mod sender;
mod transport;

pub use config::CoordinatorConfig;
pub use coordinator::{DownloadOptions, TransferCoordinator};
pub use transport::{MemoryNetwork, MemoryTransport, NetworkEvent, SendFuture, Transport};

pub use dirdelta_transfer::TransferError;
