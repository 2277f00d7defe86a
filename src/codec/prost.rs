use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use prost::Message;

use super::{Codec, Decoder, Encoder};
use crate::{Code, Status};

/// A [`Codec`] that implements `application/grpc+proto` via the prost library.
#[derive(Debug, Clone)]
pub struct ProstCodec<T, U> {
    _pd: PhantomData<(T, U)>,
}

impl<T, U> Default for ProstCodec<T, U> {
    fn default() -> Self {
        Self { _pd: PhantomData }
    }
}

impl<T, U> Codec for ProstCodec<T, U>
where
    T: Message + Send + 'static,
    U: Message + Default + Send + 'static,
{
    type Encode = T;
    type Decode = U;

    type Encoder = ProstEncoder<T>;
    type Decoder = ProstDecoder<U>;

    fn encoder(&mut self) -> Self::Encoder {
        ProstEncoder(PhantomData)
    }

    fn decoder(&mut self) -> Self::Decoder {
        ProstDecoder(PhantomData)
    }
}

/// A [`Encoder`] that knows how to encode `T`.
#[derive(Debug, Clone, Default)]
pub struct ProstEncoder<T>(PhantomData<T>);

impl<T: Message> Encoder for ProstEncoder<T> {
    type Item = T;
    type Error = Status;

    fn encode(&mut self, item: &Self::Item, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst)
            .map_err(|err| Status::internal(err.to_string()))?;

        Ok(())
    }
}

/// A [`Decoder`] that knows how to decode `U`.
#[derive(Debug, Clone, Default)]
pub struct ProstDecoder<U>(PhantomData<U>);

impl<U: Message + Default> Decoder for ProstDecoder<U> {
    type Item = U;
    type Error = Status;

    fn decode(&mut self, src: Bytes) -> Result<Self::Item, Self::Error> {
        Message::decode(src).map_err(from_decode_error)
    }
}

fn from_decode_error(error: prost::DecodeError) -> Status {
    // Map Protobuf parse errors to an INTERNAL status code, as per
    // https://github.com/grpc/grpc/blob/master/doc/statuscodes.md
    Status::new(Code::Internal, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, PartialEq, prost::Message)]
    struct Unit {
        #[prost(uint64, tag = "1")]
        id: u64,
        #[prost(string, tag = "2")]
        label: String,
    }

    #[test]
    fn prost_codec() {
        let mut c = ProstCodec::<Unit, Unit>::default();

        let unit = Unit {
            id: 42,
            label: "hello prost-codec".into(),
        };

        let mut bytes = BytesMut::new();
        c.encoder().encode(&unit, &mut bytes).unwrap();

        let back = c.decoder().decode(bytes.freeze()).unwrap();
        assert_eq!(back, unit);
    }

    #[test]
    fn prost_decode_garbage() {
        let mut c = ProstCodec::<Unit, Unit>::default();
        let err = c
            .decoder()
            .decode(Bytes::from_static(&[0xff, 0xff, 0xff]))
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }
}
