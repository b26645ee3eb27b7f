pub mod api_spec;
pub mod error;
pub mod policy;
pub mod workload;

pub use api_spec::{ApiSpecList, ApiSpecification};
pub use error::{PolicyError, Result};
pub use policy::{
    AgreementProtocol, DataVerification, HAGroup, LedgerRef, NodeHealth, Policy, PolicyHeader,
    Property,
};
pub use workload::{Torrent, Workload, WorkloadPriority};
