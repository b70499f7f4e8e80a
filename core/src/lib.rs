pub mod codec;
pub mod config;
pub mod delivery;
pub mod errors;
pub mod handler;
pub mod offsets;
pub mod record;
pub mod service;
pub mod sink;
pub mod source;
pub mod telemetry;
pub mod worker;

pub use codec::{DecodedMessage, Decoder, JsonCodec, Message, StringCodec};
pub use config::{ConsumeConfig, ListenerConfig, ProcessingConfig};
pub use errors::{ConsumeError, Result};
pub use handler::{handler_fn, Handler, HandlerRegistry};
pub use record::{Partition, Record};
pub use service::{ConsumerService, ServiceReport};
