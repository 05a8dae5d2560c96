//! Length-prefixed framing over async byte streams.
//!
//! Frame layout: `[length:u32 LE][type:u16 LE][payload]`. The length field
//! covers the type word and the payload. A frame announcing more than
//! [`MAX_FRAME_SIZE`] bytes terminates the connection; the cap matches the
//! read/write buffer sizes on every link, so no peer can legitimately exceed
//! it.

use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::ProtoError;
use crate::packets::Packet;
use crate::pool::BufferPool;

/// How long a coalescing writer waits for more packets before flushing.
pub const COALESCE_DELAY: Duration = Duration::from_millis(10);

/// Hard cap on a frame's announced length (type word + payload).
pub const MAX_FRAME_SIZE: usize = 2 * 1024 * 1024;

/// Bytes of header preceding the payload: length word + type word.
pub const FRAME_HEADER_SIZE: usize = 4 + 2;

/// Reads one complete frame, returning its type code and payload.
///
/// The payload buffer is taken from `pool`; callers hand it back with
/// [`BufferPool::release`] once the packet has been delivered.
///
/// # Errors
///
/// * [`ProtoError::FrameTooLarge`] / [`ProtoError::InvalidLength`]: the peer
///   announced an impossible length. The caller must drop the connection.
/// * [`ProtoError::Io`]: transport failure (including clean EOF).
pub async fn read_frame<R>(reader: &mut R, pool: &BufferPool) -> Result<(u16, BytesMut), ProtoError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 4];
    reader.read_exact(&mut head).await?;
    let length = u32::from_le_bytes(head);

    if (length as usize) > MAX_FRAME_SIZE {
        return Err(ProtoError::FrameTooLarge {
            size: length as usize,
        });
    }
    if length < 2 {
        return Err(ProtoError::InvalidLength { length });
    }

    let mut type_word = [0u8; 2];
    reader.read_exact(&mut type_word).await?;
    let packet_type = u16::from_le_bytes(type_word);

    let payload_len = length as usize - 2;
    let mut payload = pool.acquire(payload_len);
    payload.resize(payload_len, 0);
    reader.read_exact(&mut payload[..]).await?;

    Ok((packet_type, payload))
}

/// Writes one frame and flushes the stream.
///
/// Prefer [`encode_frame_into`] plus a single batched write when coalescing;
/// this helper is for low-rate control paths and tests.
pub async fn write_frame<W>(writer: &mut W, packet_type: u16, payload: &[u8]) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    encode_frame_into(&mut buf, packet_type, payload)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Appends a complete frame to `buf` without touching the transport.
///
/// The coalescing writers batch many frames into one buffer and flush once
/// per delay window; this is their building block.
pub fn encode_frame_into(buf: &mut BytesMut, packet_type: u16, payload: &[u8]) -> Result<(), ProtoError> {
    let length = payload.len() + 2;
    if length > MAX_FRAME_SIZE {
        return Err(ProtoError::FrameTooLarge { size: length });
    }
    buf.reserve(FRAME_HEADER_SIZE + payload.len());
    buf.put_u32_le(length as u32);
    buf.put_u16_le(packet_type);
    buf.put_slice(payload);
    Ok(())
}

/// Reads and decodes one packet, returning its payload buffer to `pool`.
pub async fn read_packet<R>(reader: &mut R, pool: &BufferPool) -> Result<Packet, ProtoError>
where
    R: AsyncRead + Unpin,
{
    let (packet_type, payload) = read_frame(reader, pool).await?;
    let result = Packet::decode(packet_type, &mut &payload[..]);
    pool.release(payload);
    result
}

/// Drains `rx` onto `writer`, batching frames for up to [`COALESCE_DELAY`]
/// before each flush to amortize syscalls.
///
/// Returns when the channel closes (clean shutdown) or the transport fails.
pub async fn run_coalescing_writer<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Packet>,
    delay: Duration,
) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    while let Some(packet) = rx.recv().await {
        packet.encode_frame(&mut buf)?;

        let deadline = tokio::time::sleep(delay);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                more = rx.recv() => match more {
                    Some(packet) => {
                        packet.encode_frame(&mut buf)?;
                        if buf.len() >= MAX_FRAME_SIZE {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        writer.write_all(&buf).await?;
        writer.flush().await?;
        buf.clear();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let pool = BufferPool::default();

        write_frame(&mut a, 3, b"payload bytes").await.expect("write");
        let (ty, payload) = read_frame(&mut b, &pool).await.expect("read");
        assert_eq!(ty, 3);
        assert_eq!(&payload[..], b"payload bytes");
    }

    #[tokio::test]
    async fn empty_payload_frame() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let pool = BufferPool::default();

        write_frame(&mut a, 30, b"").await.expect("write");
        let (ty, payload) = read_frame(&mut b, &pool).await.expect("read");
        assert_eq!(ty, 30);
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn oversize_frame_is_rejected_before_reading_payload() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let pool = BufferPool::default();

        let bogus = ((MAX_FRAME_SIZE + 1) as u32).to_le_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &bogus).await.expect("write");

        let err = read_frame(&mut b, &pool).await.unwrap_err();
        assert!(matches!(err, ProtoError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn undersize_length_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let pool = BufferPool::default();

        tokio::io::AsyncWriteExt::write_all(&mut a, &1u32.to_le_bytes())
            .await
            .expect("write");
        let err = read_frame(&mut b, &pool).await.unwrap_err();
        assert!(matches!(err, ProtoError::InvalidLength { length: 1 }));
    }

    #[test]
    fn encode_frame_rejects_oversize_payload() {
        let mut buf = BytesMut::new();
        let payload = vec![0u8; MAX_FRAME_SIZE];
        let err = encode_frame_into(&mut buf, 1, &payload).unwrap_err();
        assert!(matches!(err, ProtoError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn coalescing_writer_preserves_order() {
        let (a, mut b) = tokio::io::duplex(64 * 1024);
        let pool = BufferPool::default();
        let (tx, rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(run_coalescing_writer(a, rx, COALESCE_DELAY));
        for i in 0..10u64 {
            tx.send(Packet::Call {
                from: None,
                to: crate::ids::EntityId::new(),
                method: format!("m{i}"),
                args: vec![],
            })
            .expect("send");
        }
        drop(tx);

        for i in 0..10u64 {
            let packet = read_packet(&mut b, &pool).await.expect("read");
            match packet {
                Packet::Call { method, .. } => assert_eq!(method, format!("m{i}")),
                other => panic!("unexpected packet {other:?}"),
            }
        }
        writer.await.expect("join").expect("clean exit");
    }

    #[tokio::test]
    async fn batched_frames_decode_in_order() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let pool = BufferPool::default();

        let mut batch = BytesMut::new();
        for i in 0u16..5 {
            encode_frame_into(&mut batch, i, format!("frame-{i}").as_bytes()).expect("encode");
        }
        tokio::io::AsyncWriteExt::write_all(&mut a, &batch).await.expect("write");

        for i in 0u16..5 {
            let (ty, payload) = read_frame(&mut b, &pool).await.expect("read");
            assert_eq!(ty, i);
            assert_eq!(&payload[..], format!("frame-{i}").as_bytes());
        }
    }
}
