use bytes::Bytes;
use prost::Message;

use crate::{Error, Result};
use crate::codec::Codec;
use crate::record::{Flags, Record};

pub(crate) const NAME: &str = "proto";

#[derive(Clone, PartialEq, prost::Message)]
struct RecordProto {
    #[prost(string, optional, tag = "1")]
    key: Option<String>,
    #[prost(uint64, tag = "2")]
    watermark: u64,
    #[prost(uint32, tag = "3")]
    flags: u32,
    #[prost(bytes = "bytes", optional, tag = "4")]
    payload: Option<Bytes>,
}

/// Protobuf binary encoding, the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtoCodec;

impl Codec for ProtoCodec {
    fn name(&self) -> &str {
        NAME
    }

    fn encode(&self, record: &Record) -> Result<Bytes> {
        let proto = RecordProto {
            key: record.key().map(str::to_string),
            watermark: record.watermark(),
            flags: u32::from(record.flags().bits()),
            payload: record.payload().cloned(),
        };
        Ok(proto.encode_to_vec().into())
    }

    fn decode(&self, data: &[u8]) -> Result<Record> {
        let proto = RecordProto::decode(data)?;
        let flags = u8::try_from(proto.flags)
            .map_err(|_| Error::Codec(format!("invalid flags: {}", proto.flags)))?;
        Ok(Record::new(
            proto.key,
            proto.payload,
            proto.watermark,
            Flags::from_bits(flags),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_out_of_range() {
        let data = RecordProto {
            key: Some("k".to_string()),
            watermark: 0,
            flags: 256,
            payload: None,
        }
        .encode_to_vec();
        assert!(matches!(ProtoCodec.decode(&data), Err(Error::Codec(_))));

        let data = RecordProto {
            key: Some("k".to_string()),
            watermark: 0,
            flags: 0x82,
            payload: None,
        }
        .encode_to_vec();
        let record = ProtoCodec.decode(&data).unwrap();
        assert!(record.has_flag(Flags::COMMIT));
        assert!(record.has_flag(Flags::USER2));
    }
}
