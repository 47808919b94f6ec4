use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::Error;
use crate::Result;
use crate::codec::Codec;
use crate::record::{Flags, Record};

pub(crate) const NAME: &str = "json";

#[derive(Serialize, Deserialize)]
struct RecordJson {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    watermark: u64,
    flags: u8,
    /// base64 encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
}

/// Human readable encoding, the payload is base64 encoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &str {
        NAME
    }

    fn encode(&self, record: &Record) -> Result<Bytes> {
        let json = RecordJson {
            key: record.key().map(str::to_string),
            watermark: record.watermark(),
            flags: record.flags().bits(),
            payload: record.payload().map(|p| BASE64_STANDARD.encode(p)),
        };
        Ok(serde_json::to_vec(&json)?.into())
    }

    fn decode(&self, data: &[u8]) -> Result<Record> {
        let json: RecordJson = serde_json::from_slice(data)?;
        let payload = json
            .payload
            .map(|p| BASE64_STANDARD.decode(p.as_bytes()))
            .transpose()
            .map_err(|e| Error::Codec(format!("invalid payload: {e}")))?
            .map(Bytes::from);
        Ok(Record::new(
            json.key,
            payload,
            json.watermark,
            Flags::from_bits(json.flags),
        ))
    }
}
