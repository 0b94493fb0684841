//! Push RPC wire format
//!
//! Each message is one JSON document in a length-delimited frame. A client
//! sends [`RpcRequest`]s and reads back the [`RpcResponse`] with the same id.
//! Field validity is checked once, by [`Call::validate`], before any handler
//! runs.

use std::io;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Largest accepted frame; a serialized tree above this is refused.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;
const MAX_UUID_LENGTH: usize = 128;

/// Failure returned to the remote caller.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum PushError {
    #[error("client is waiting for approval")]
    Waiting,
    #[error("client is not allowed")]
    NotAllowed,
    #[error("waiting list is full ({0} clients)")]
    CapacityExceeded(usize),
    #[error("cannot decode payload: {0}")]
    CannotDecode(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloRequest {
    pub hostname: String,
    pub uuid: String,
    #[serde(default)]
    pub uuid_signature: Vec<u8>,
}

/// Credentials of an established session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub uuid: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub uuid: String,
    pub token: String,
    /// Serialized `Node` of the client.
    pub node: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum Call {
    GetServerCertificate,
    Register(HelloRequest),
    GetUuidSignature(HelloRequest),
    Hello(HelloRequest),
    Update(UpdateRequest),
    Goodbye(Request),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Certificate(String),
    Ack,
    Signature(Vec<u8>),
    Token(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub call: Call,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    pub result: Result<Reply, PushError>,
}

fn invalid(message: impl Into<String>) -> PushError {
    PushError::InvalidRequest(message.into())
}

fn check_uuid(uuid: &str) -> Result<(), PushError> {
    if uuid.is_empty() || uuid.len() > MAX_UUID_LENGTH || uuid.chars().any(char::is_whitespace) {
        return Err(invalid("malformed uuid"));
    }
    Ok(())
}

fn check_hostname(hostname: &str) -> Result<(), PushError> {
    if hostname.trim().is_empty() || hostname.chars().any(char::is_control) {
        return Err(invalid("malformed hostname"));
    }
    Ok(())
}

fn check_token(token: &str) -> Result<(), PushError> {
    if token.is_empty() {
        return Err(invalid("missing token"));
    }
    Ok(())
}

impl Call {
    pub fn name(&self) -> &'static str {
        match self {
            Call::GetServerCertificate => "GetServerCertificate",
            Call::Register(_) => "Register",
            Call::GetUuidSignature(_) => "GetUuidSignature",
            Call::Hello(_) => "Hello",
            Call::Update(_) => "Update",
            Call::Goodbye(_) => "Goodbye",
        }
    }

    pub fn validate(&self) -> Result<(), PushError> {
        match self {
            Call::GetServerCertificate => Ok(()),
            Call::Register(hello) | Call::GetUuidSignature(hello) => {
                check_uuid(&hello.uuid)?;
                check_hostname(&hello.hostname)
            }
            Call::Hello(hello) => {
                check_uuid(&hello.uuid)?;
                check_hostname(&hello.hostname)?;
                if hello.uuid_signature.is_empty() {
                    return Err(invalid("missing uuid signature"));
                }
                Ok(())
            }
            Call::Update(update) => {
                check_uuid(&update.uuid)?;
                check_token(&update.token)?;
                if update.node.is_empty() {
                    return Err(invalid("empty node payload"));
                }
                Ok(())
            }
            Call::Goodbye(request) => {
                check_uuid(&request.uuid)?;
                check_token(&request.token)
            }
        }
    }
}

pub type Transport<S> = Framed<S, LengthDelimitedCodec>;

pub fn framed<S: AsyncRead + AsyncWrite>(io: S) -> Transport<S> {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec();
    Framed::new(io, codec)
}

pub async fn write_frame<S, T>(transport: &mut Transport<S>, message: &T) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(message)?;
    transport.send(Bytes::from(bytes)).await
}

/// Next message, or `None` once the peer closed the stream.
pub async fn read_frame<S, T>(transport: &mut Transport<S>) -> io::Result<Option<T>>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: DeserializeOwned,
{
    match transport.next().await {
        None => Ok(None),
        Some(frame) => Ok(Some(serde_json::from_slice(&frame?)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello(uuid: &str, signature: Vec<u8>) -> HelloRequest {
        HelloRequest {
            hostname: "web-1".into(),
            uuid: uuid.into(),
            uuid_signature: signature,
        }
    }

    #[test]
    fn test_validation_happens_per_call() {
        assert!(Call::Register(hello("u-1", vec![])).validate().is_ok());
        assert!(Call::Register(hello("", vec![])).validate().is_err());
        assert!(Call::Register(hello("u 1", vec![])).validate().is_err());
        assert!(Call::Hello(hello("u-1", vec![])).validate().is_err());
        assert!(Call::Hello(hello("u-1", vec![1])).validate().is_ok());

        let update = UpdateRequest {
            uuid: "u-1".into(),
            token: String::new(),
            node: "{}".into(),
        };
        assert_eq!(
            Call::Update(update).validate(),
            Err(PushError::InvalidRequest("missing token".into()))
        );
    }

    #[test]
    fn test_request_json_shape() {
        let request = RpcRequest {
            id: 7,
            call: Call::Goodbye(Request {
                uuid: "u-1".into(),
                token: "t".into(),
            }),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["call"]["method"], "Goodbye");
        assert_eq!(json["call"]["params"]["token"], "t");
    }

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let mut client = framed(client);
        let mut server = framed(server);

        let response = RpcResponse {
            id: 1,
            result: Err(PushError::Waiting),
        };
        write_frame(&mut server, &response).await.unwrap();
        drop(server);

        let received: RpcResponse = read_frame(&mut client).await.unwrap().unwrap();
        assert_eq!(received.id, 1);
        assert_eq!(received.result, Err(PushError::Waiting));
        assert!(read_frame::<_, RpcResponse>(&mut client).await.unwrap().is_none());
    }
}
