mod batch;
mod fetcher_impls;
mod fetcher_traits;
mod maintenance;
mod pipeline;
mod tracker;

pub use batch::{BatchScheduler, BatchSettings};
pub use fetcher_impls::ChainClients;
pub use maintenance::run_wal_checkpoint_once;
pub use pipeline::UserPipeline;
pub use tracker::read_sync_status;
