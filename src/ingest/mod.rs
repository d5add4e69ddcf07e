//! Upload ingestion: the session state machine, the coordinator that drives
//! sessions from credential to committed file, and the background sweeper.

pub mod state;
pub mod coordinator;
pub mod sweeper;

pub use coordinator::IngestionCoordinator;
pub use sweeper::{SweepReport, UploadSweeper};
