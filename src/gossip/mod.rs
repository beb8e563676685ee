//! Gossip engine
//!
//! Request tracking, transaction processing and fan-out on top of the
//! connection manager.

pub mod broadcast;
pub mod metrics;
pub mod processor;
pub mod request_queue;
pub mod requester;
pub mod work_unit;

pub use broadcast::{broadcast_queue, BroadcastItem, BroadcastQueue, Broadcaster};
pub use metrics::{RequestQueueSnapshot, ServerMetrics, ServerMetricsSnapshot};
pub use processor::{Collaborators, Processor, ProcessorConfig, WorkItem};
pub use request_queue::{Request, RequestFilter, RequestQueue, SharedRequestQueue};
pub use requester::{Requester, RequesterConfig};
pub use work_unit::{WorkAction, WorkUnit, WorkUnitCache, WorkUnitState};
