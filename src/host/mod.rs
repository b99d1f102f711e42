//! Host controller: collection server, artifact store, reputation lookup and
//! the session state machine.

mod reputation;
mod server;
mod session;
mod store;

pub use reputation::{VirusTotal, sha256_hex};
pub use server::{CollectionServer, CollectionState, router};
pub use session::{
    DriverSettings, HostState, MEMORY_CAPTURE, REPUTATION_REPORT, SESSION_SUMMARY, Sample,
    SessionDriver, SessionOutcome, Transition,
};
pub use store::{ArtifactStore, DiskStore, FileStore};
