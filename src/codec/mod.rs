//! Generic encoding and decoding.
//!
//! This module contains the generic [`Codec`], [`Encoder`] and [`Decoder`]
//! traits, a protobuf codec based on prost, a JSON codec based on serde, and
//! the content-type negotiation shared by the client and the server.

mod json;
mod prost;

use bytes::{Bytes, BytesMut};

use crate::Status;

pub use self::json::{JsonCodec, JsonDecoder, JsonEncoder};
pub use self::prost::{ProstCodec, ProstDecoder, ProstEncoder};

/// The message encoding negotiated through the `content-type` header.
///
/// A bare `application/grpc` is treated as protobuf, per the gRPC over HTTP/2
/// convention.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Encoding {
    /// `application/grpc+proto`
    #[default]
    Proto,
    /// `application/grpc+json`
    Json,
}

impl Encoding {
    /// Parse a `content-type` header value. Returns `None` for anything that
    /// is not a recognized gRPC content type.
    pub fn from_content_type(value: &str) -> Option<Encoding> {
        match value {
            "application/grpc" | "application/grpc+proto" => Some(Encoding::Proto),
            "application/grpc+json" => Some(Encoding::Json),
            _ => None,
        }
    }

    /// The `content-type` header value sent for this encoding.
    pub fn to_content_type(self) -> &'static str {
        match self {
            Encoding::Proto => "application/grpc+proto",
            Encoding::Json => "application/grpc+json",
        }
    }
}

/// Trait that knows how to encode and decode gRPC messages.
pub trait Codec {
    /// The encodable message.
    type Encode: Send + 'static;
    /// The decodable message.
    type Decode: Send + 'static;

    /// The encoder that can encode a message.
    type Encoder: Encoder<Item = Self::Encode, Error = Status> + Send + 'static;
    /// The encoder that can decode a message.
    type Decoder: Decoder<Item = Self::Decode, Error = Status> + Send + 'static;

    /// Fetch the encoder.
    fn encoder(&mut self) -> Self::Encoder;
    /// Fetch the decoder.
    fn decoder(&mut self) -> Self::Decoder;
}

/// Encodes gRPC message types.
pub trait Encoder {
    /// The type that is encoded.
    type Item;

    /// The type of unrecoverable message encoding errors.
    type Error;

    /// Encodes a message into the provided buffer.
    fn encode(&mut self, item: &Self::Item, dst: &mut BytesMut) -> Result<(), Self::Error>;
}

/// Decodes gRPC message types.
pub trait Decoder {
    /// The type that is decoded.
    type Item;

    /// The type of unrecoverable message decoding errors.
    type Error;

    /// Decode a message from the buffer.
    ///
    /// The buffer contains exactly the bytes of a full message; gRPC framing
    /// has already been stripped.
    fn decode(&mut self, src: Bytes) -> Result<Self::Item, Self::Error>;
}

/// Encode `message` with the codec selected by `encoding`.
///
/// Messages carry both prost and serde implementations so that a single
/// registered handler serves either negotiated content-type.
pub fn encode_message<M>(encoding: Encoding, message: &M) -> Result<Bytes, Status>
where
    M: ::prost::Message + serde::Serialize + Default + Send + 'static,
{
    let mut dst = BytesMut::new();
    match encoding {
        Encoding::Proto => ProstCodec::<M, M>::default()
            .encoder()
            .encode(message, &mut dst)?,
        Encoding::Json => JsonEncoder::<M>::default().encode(message, &mut dst)?,
    }
    Ok(dst.freeze())
}

/// Decode a message with the codec selected by `encoding`.
pub fn decode_message<M>(encoding: Encoding, src: Bytes) -> Result<M, Status>
where
    M: ::prost::Message + serde::de::DeserializeOwned + Default + Send + 'static,
{
    match encoding {
        Encoding::Proto => ProstCodec::<M, M>::default().decoder().decode(src),
        Encoding::Json => JsonDecoder::<M>::default().decode(src),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_negotiation() {
        assert_eq!(
            Encoding::from_content_type("application/grpc"),
            Some(Encoding::Proto)
        );
        assert_eq!(
            Encoding::from_content_type("application/grpc+proto"),
            Some(Encoding::Proto)
        );
        assert_eq!(
            Encoding::from_content_type("application/grpc+json"),
            Some(Encoding::Json)
        );
        assert_eq!(Encoding::from_content_type("text/html"), None);
        assert_eq!(Encoding::from_content_type("application/grpc+thrift"), None);
    }

    #[derive(Clone, PartialEq, ::prost::Message, serde::Serialize, serde::Deserialize)]
    struct Echo {
        #[prost(string, tag = "1")]
        text: String,
    }

    #[test]
    fn negotiated_proto() {
        let msg = Echo {
            text: "ping".into(),
        };
        let bytes = encode_message(Encoding::Proto, &msg).unwrap();
        let back: Echo = decode_message(Encoding::Proto, bytes).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn negotiated_json() {
        let msg = Echo {
            text: "ping".into(),
        };
        let bytes = encode_message(Encoding::Json, &msg).unwrap();
        assert_eq!(&bytes[..], br#"{"text":"ping"}"#);
        let back: Echo = decode_message(Encoding::Json, bytes).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn garbage_does_not_decode() {
        let res: Result<Echo, _> = decode_message(Encoding::Json, Bytes::from_static(b"{nope"));
        assert!(res.is_err());
    }
}
