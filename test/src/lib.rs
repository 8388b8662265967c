//! # Concord Test
//! In-memory multi-node harness for exercising the replicated context across
//! a full cluster: a process-local message bus with per-node FIFO dispatch,
//! a diff-capable test value type, and cluster assembly helpers.

mod cluster;
mod local_bus;
mod record;

pub use cluster::{build_cluster, TestCluster, TestContext, TOPIC};
pub use local_bus::{BusNetwork, LocalBus};
pub use record::TestRecord;
