pub mod crypto_feed;
pub mod equity_feed;
pub mod fx_feed;
pub mod synthetic;

pub use crypto_feed::CryptoFeed;
pub use equity_feed::EquityFeed;
pub use fx_feed::FxFeed;
