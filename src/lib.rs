//! Block Array CSI Driver
//!
//! Exposes an iSCSI block array as provisionable volumes to a container
//! orchestrator.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                 Transport Adapter (JSON over HTTP)                   │
//! │        routine logging · metrics · /csi.v1.<Service>/<Method>        │
//! ├───────────────────────────────────┬──────────────────────────────────┤
//! │          Controller Service       │          Node Agent              │
//! │  ┌──────────────┐ ┌─────────────┐ │  ┌────────────┐ ┌─────────────┐  │
//! │  │   Volume     │ │  Snapshot   │ │  │  publish   │ │  connector  │  │
//! │  │ Orchestrator │ │ Orchestrator│ │  │  gate (1)  │ │   store     │  │
//! │  └──────┬───────┘ └──────┬──────┘ │  └─────┬──────┘ └─────────────┘  │
//! │         │  LUN Allocator │        │        │                         │
//! │  ┌──────┴────────────────┴──────┐ │  ┌─────┴──────┐ ┌─────────────┐  │
//! │  │     Mutation Serializer      │ │  │  iscsiadm  │ │ mkfs/fsck/  │  │
//! │  │      (one array session)     │ │  │  + sysfs   │ │ mount       │  │
//! │  └──────────────┬───────────────┘ │  └────────────┘ └─────────────┘  │
//! ├─────────────────┴─────────────────┴──────────────────────────────────┤
//! │        Array Client: REST management API  |  in-memory array         │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`api`]: RPC transport adapter, metrics and server
//! - [`controlplane`]: volume, LUN and snapshot orchestration
//! - [`node`]: iSCSI attach, filesystem preparation and mount
//! - [`domain`]: core types, request structs and ports
//! - [`error`]: error types and protocol status mapping

pub mod api;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod node;

// Re-export commonly used types
pub use api::{ApiServer, ApiServerConfig, CsiRouter, RpcMetrics};

pub use controlplane::{
    next_available_lun, BackendConfig, BackendFactory, ControllerConfig, ControllerService,
    InMemoryArray, LunScope, MutationSerializer, RestArrayClient, RestArrayConfig,
};

pub use domain::ports::{
    AccessMode, ArrayClient, ArrayClientRef, ArrayCredentials, AttachedDevice, FilesystemTools,
    FilesystemToolsRef, HostMapping, IscsiConnector, IscsiConnectorRef, IscsiTarget,
    VolumeCapability,
};

pub use domain::fault::{ArrayOutcome, FaultCode};

pub use error::{Error, Result, RpcCode};

pub use node::{
    AttachmentState, ConnectorState, ConnectorStore, HostFilesystem, IscsiAdm, IscsiConfig,
    NodeAgent, NodeConfig, ReadinessProbe,
};

/// Driver version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Driver name
pub const NAME: &str = env!("CARGO_PKG_NAME");
