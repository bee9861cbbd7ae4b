// ABOUTME: Pluggable socket transport abstraction for chatwire.
// ABOUTME: Provides the Transport trait, a Send+Sync channel-backed handle, and a scripted mock backend.

pub mod event;
pub mod traits;
pub mod handle;
pub mod registry;

pub mod backends;

pub use event::TransportEvent;
pub use traits::Transport;
pub use handle::{EventReceiver, TransportHandle};
pub use registry::{TransportFactory, TransportRegistry};
