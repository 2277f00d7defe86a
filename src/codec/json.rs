use std::marker::PhantomData;

use bytes::{BufMut, Bytes, BytesMut};

use super::{Codec, Decoder, Encoder};
use crate::{Code, Status};

/// A [`Codec`] that implements `application/grpc+json` via the serde library.
#[derive(Debug, Clone)]
pub struct JsonCodec<T, U> {
    _pd: PhantomData<(T, U)>,
}

impl<T, U> Default for JsonCodec<T, U> {
    fn default() -> Self {
        Self { _pd: PhantomData }
    }
}

impl<T, U> Codec for JsonCodec<T, U>
where
    T: serde::Serialize + Send + 'static,
    U: serde::de::DeserializeOwned + Send + 'static,
{
    type Encode = T;
    type Decode = U;

    type Encoder = JsonEncoder<T>;
    type Decoder = JsonDecoder<U>;

    fn encoder(&mut self) -> Self::Encoder {
        JsonEncoder(PhantomData)
    }

    fn decoder(&mut self) -> Self::Decoder {
        JsonDecoder(PhantomData)
    }
}

#[derive(Debug, Clone, Default)]
pub struct JsonEncoder<T>(PhantomData<T>);

impl<T: serde::Serialize> Encoder for JsonEncoder<T> {
    type Item = T;
    type Error = Status;

    fn encode(&mut self, item: &Self::Item, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(item).map_err(from_codec_error)?;
        dst.put_slice(&json);

        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct JsonDecoder<U>(PhantomData<U>);

impl<U: serde::de::DeserializeOwned> Decoder for JsonDecoder<U> {
    type Item = U;
    type Error = Status;

    fn decode(&mut self, src: Bytes) -> Result<Self::Item, Self::Error> {
        serde_json::from_slice(&src).map_err(from_codec_error)
    }
}

fn from_codec_error(error: serde_json::Error) -> Status {
    // Map JSON codec errors to an INTERNAL status code, as per
    // https://github.com/grpc/grpc/blob/master/doc/statuscodes.md
    Status::new(Code::Internal, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(serde::Serialize, serde::Deserialize, Debug)]
    struct Person {
        name: String,
    }

    #[test]
    fn json_codec() {
        let mut c = JsonCodec::<Person, Person>::default();

        let p = Person {
            name: "hello json-codec".into(),
        };
        let mut bytes = BytesMut::new();
        c.encoder().encode(&p, &mut bytes).unwrap();
        assert_eq!(&bytes[..], b"{\"name\":\"hello json-codec\"}");

        let p: Person = c.decoder().decode(bytes.freeze()).unwrap();
        assert_eq!(p.name, "hello json-codec");
    }

    #[test]
    fn json_decode_garbage() {
        let mut c = JsonCodec::<Person, Person>::default();
        let err = c
            .decoder()
            .decode(Bytes::from_static(b"{\"name\""))
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }
}
