mod connecter;
pub mod wire;

pub use connecter::{exchange_on, ConnectOptions, ExchangeError, MetadataChannel, MetadataListener};
pub use wire::WireError;
