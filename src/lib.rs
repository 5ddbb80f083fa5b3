//! Client-side notification subsystem for TicketHawk: a deduplicating,
//! read-state-tracking store fed by a session-gated websocket push channel,
//! with permission-gated out-of-band delivery.
//!
//! The pieces compose around two seams: [`store::SharedStore`] (what arrived)
//! and [`session::SessionHandle`] (whether a channel should exist at all).
//! [`remote::LiveChannelClient`] owns everything in between.

pub mod cli;
pub mod domain;
pub mod notify;
pub mod remote;
pub mod session;
pub mod store;
