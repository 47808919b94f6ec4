//! Wire format of the records stored in the log. All the records of a stream must be written
//! with the same codec.

use std::fmt::Debug;
use std::sync::Arc;

use bytes::Bytes;

use crate::Error;
use crate::Result;
use crate::record::Record;

pub mod json;
pub mod proto;

pub use json::JsonCodec;
pub use proto::ProtoCodec;

pub trait Codec: Send + Sync + Debug {
    /// Name used to compare codecs and to select them from the configuration.
    fn name(&self) -> &str;

    fn encode(&self, record: &Record) -> Result<Bytes>;

    fn decode(&self, data: &[u8]) -> Result<Record>;
}

/// The codec used when nothing is configured.
pub fn default_codec() -> Arc<dyn Codec> {
    Arc::new(ProtoCodec)
}

pub fn codec_by_name(name: &str) -> Result<Arc<dyn Codec>> {
    match name {
        proto::NAME => Ok(Arc::new(ProtoCodec)),
        json::NAME => Ok(Arc::new(JsonCodec)),
        other => Err(Error::Config(format!("unknown codec: {other}"))),
    }
}
