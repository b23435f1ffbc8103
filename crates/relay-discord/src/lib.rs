//! Discord REST transport for relay deliveries.

pub mod discord_transport;

pub use discord_transport::{
    DiscordRestTransport, DiscordTransportConfig, DEFAULT_DISCORD_API_BASE,
    DEFAULT_HTTP_TIMEOUT_MS,
};
