//! Bidirectional framed message channels for the plexus runtime.
//!
//! A [`Channel`] carries [`Envelope`](plexus_protocol::Envelope)s over a
//! reliable ordered byte stream and correlates responses with requests by
//! ordinal. Inbound requests are dispatched to one registered
//! [`InboundHandler`] per message label on a bounded worker pool; state
//! transitions fan out to registered observers.
//!
//! Delivery is ordered per channel. Nothing is promised across channels.

#![forbid(unsafe_code)]

mod channel;
mod listener;

pub use channel::{Channel, ChannelId, ChannelState, Handlers, InboundHandler, StateObserver};
pub use listener::ChannelListener;
