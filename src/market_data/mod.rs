pub mod backoff;
pub mod candle_sync;
pub mod instrument_sync;
pub mod trade_stream;

pub use candle_sync::{CandleSyncEngine, CandleSyncSettings};
pub use instrument_sync::InstrumentSynchronizer;
pub use trade_stream::{EndpointDialer, StreamStats, TradeStreamIngestor};
