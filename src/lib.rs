pub mod bridge;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod external;
pub mod field;
pub mod grown;
pub mod host;
pub mod logger;
pub mod plant;
pub mod port;
pub mod proc;
pub mod queue;
pub mod resolver;
pub mod router;
pub mod supervisor;

pub use descriptor::ServiceDescriptor;
pub use error::{GrowError, Result};
pub use field::{Contract, Field, PlantDef, ProcDef, ValidField};
pub use grown::{Grown, grow, grow_with};
pub use plant::{CallContext, Catalog, Plant, Wiring};
pub use router::{PlantHandle, PlantProxy, QueueHandle, QueueProxy};
pub use supervisor::ProcState;

pub use grow_wire::{ErrorKind, MAIN_PROC, ORCHESTRATOR, RemoteError};
