pub mod memory;
pub mod segment;
pub mod types;

pub use memory::{CoreFixture, Fixture, MemoryCore, load_fixture};
pub use segment::{IndexCore, Segment, SegmentHandle, SegmentIdentity, Snapshot};
pub use types::*;
