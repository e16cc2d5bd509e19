//! Engine module - buffer memory for the transport
//!
//! Pages of fixed-size slots, the leases that hand them out, and the pool
//! that grows and sweeps the pages.

pub mod buffer;
pub mod lease;
pub mod page;

pub use buffer::{shared_pool, BufferPool, PoolStats};
pub use lease::Lease;
pub use page::{BufferPage, SlotWindow};
