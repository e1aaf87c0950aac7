//! Wire framing for the payload-by-number request-response protocol.
//!
//! # Wire Format
//!
//! ```text
//! request:  [block number: u64 LE]                 (write half closed after)
//! response: [length: u32 LE][encoded payload]      (write half closed after)
//! ```
//!
//! The response length is checked against the configured maximum before the
//! body is allocated.

use crate::error::RequestError;
use libp2p::StreamProtocol;
use opsync_types::{decode_payload, encode_payload, ExecutionPayload};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A byte stream to a peer. Closing the write half is `shutdown`.
pub trait PayloadStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PayloadStream for T {}

/// Boxed stream handed out by the transport.
pub type BoxStream = Box<dyn PayloadStream>;

/// Protocol identifier for payload-by-number sync on the given L2 chain.
pub fn payload_by_number_protocol(l2_chain_id: u64) -> StreamProtocol {
    StreamProtocol::try_from_owned(format!(
        "/opstack/{l2_chain_id}/reqresp/payload_by_number/0.1.0"
    ))
    .expect("protocol id starts with a slash")
}

/// Write the requested block number and close the write half.
pub(crate) async fn write_request<W>(io: &mut W, number: u64) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    io.write_all(&number.to_le_bytes()).await?;
    io.shutdown().await
}

/// Read the requested block number.
pub(crate) async fn read_request<R>(io: &mut R) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8];
    io.read_exact(&mut buf).await?;
    Ok(u64::from_le_bytes(buf))
}

/// Frame and write a response payload, closing the write half.
pub(crate) async fn write_response<W>(
    io: &mut W,
    payload: &ExecutionPayload,
) -> Result<(), RequestError>
where
    W: AsyncWrite + Unpin,
{
    let body = encode_payload(payload)?;
    io.write_all(&(body.len() as u32).to_le_bytes()).await?;
    io.write_all(&body).await?;
    io.shutdown().await?;
    Ok(())
}

/// Read a length-prefixed response, rejecting oversized frames before
/// allocating for the body.
pub(crate) async fn read_response<R>(
    io: &mut R,
    max_len: u32,
) -> Result<ExecutionPayload, RequestError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let length = u32::from_le_bytes(len_buf);
    if length > max_len {
        return Err(RequestError::ResponseTooLarge {
            length,
            limit: max_len,
        });
    }
    let mut body = vec![0u8; length as usize];
    io.read_exact(&mut body).await?;
    Ok(decode_payload(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsync_types::Hash;

    #[test]
    fn protocol_id_embeds_chain_id() {
        let protocol = payload_by_number_protocol(902);
        assert_eq!(
            protocol.as_ref(),
            "/opstack/902/reqresp/payload_by_number/0.1.0"
        );
    }

    #[tokio::test]
    async fn request_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_request(&mut client, 0xdead_beef).await.unwrap();
        assert_eq!(read_request(&mut server).await.unwrap(), 0xdead_beef);
    }

    #[tokio::test]
    async fn response_roundtrip() {
        let payload = ExecutionPayload::new(
            Hash::from_bytes(b"parent"),
            12,
            1_700_000_012,
            Hash::from_bytes(b"state"),
            vec![vec![1, 2, 3]],
        );

        let (mut client, mut server) = tokio::io::duplex(1 << 16);
        write_response(&mut server, &payload).await.unwrap();
        let decoded = read_response(&mut client, 1 << 20).await.unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        server.write_all(&u32::MAX.to_le_bytes()).await.unwrap();

        let err = read_response(&mut client, 1024).await.unwrap_err();
        assert!(matches!(err, RequestError::ResponseTooLarge { .. }));
    }

    #[tokio::test]
    async fn truncated_body_is_a_transport_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        server.write_all(&100u32.to_le_bytes()).await.unwrap();
        server.write_all(&[0u8; 10]).await.unwrap();
        server.shutdown().await.unwrap();
        drop(server);

        let err = read_response(&mut client, 1024).await.unwrap_err();
        assert!(matches!(err, RequestError::Transport(_)));
    }
}
