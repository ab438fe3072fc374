pub mod coordinator;

pub use coordinator::{SearchCoordinator, partition, partition_segments};
