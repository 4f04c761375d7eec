pub mod channel;
pub mod events;
pub mod fetch;

pub use channel::{Channel, compose_keys, decompose_keys};
pub use events::{Action, Card, InboundCard, InboundMessage, OutboundMessage};
pub use fetch::CardImageFetch;
