// ABOUTME: Transport backend implementations.
// ABOUTME: Each backend implements the Transport trait and is spawned behind a TransportHandle.

pub mod mock;
