//! Channels and the components that create them.
//!
//! Outbound channels are created by a [channel_creator::ChannelCreator], which holds a fixed
//!  budget of permits that it obtained from a [reservation::Reservation]. Inbound channels are
//!  accepted by a [channel_server::ChannelServer], which is not subject to reservations.

pub mod channel;
pub mod channel_creator;
pub mod channel_server;
pub mod dispatcher;
pub mod filter;
pub mod handlers;
pub mod reservation;
