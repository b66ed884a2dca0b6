//! In-process transport pair
//!
//! Both ends speak the real length-prefixed codec over a
//! [`tokio::io::duplex`] pipe.

use crate::StreamTransport;
use tokio::io::DuplexStream;

/// Buffer size of each direction of the pipe
pub const DEFAULT_BUFFER: usize = 256 * 1024;

/// Create two connected transports: `(relay_side, agent_side)`
pub fn pair() -> (StreamTransport<DuplexStream>, StreamTransport<DuplexStream>) {
    pair_with_buffer(DEFAULT_BUFFER)
}

pub fn pair_with_buffer(
    buffer: usize,
) -> (StreamTransport<DuplexStream>, StreamTransport<DuplexStream>) {
    let (a, b) = tokio::io::duplex(buffer);
    (StreamTransport::new(a, None), StreamTransport::new(b, None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FrameTransport, TransportError};
    use certion_proto::TunnelFrame;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_frames_cross_the_pair_in_order() {
        let (relay, agent) = pair();
        let (mut relay_tx, _relay_rx) = Box::new(relay).split();
        let (_agent_tx, mut agent_rx) = Box::new(agent).split();

        for id in 1..=3u64 {
            relay_tx
                .send_frame(TunnelFrame::RequestEnd { request_id: id })
                .await
                .unwrap();
        }

        for id in 1..=3u64 {
            let frame = agent_rx.recv_frame().await.unwrap().unwrap();
            assert_eq!(frame, TunnelFrame::RequestEnd { request_id: id });
        }
    }

    #[tokio::test]
    async fn test_close_is_seen_as_end_of_stream() {
        let (relay, agent) = pair();
        let (mut relay_tx, relay_rx) = Box::new(relay).split();
        let (_agent_tx, mut agent_rx) = Box::new(agent).split();

        relay_tx.close().await.unwrap();
        drop(relay_tx);
        drop(relay_rx);

        assert!(agent_rx.recv_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_end_source() {
        let (mut raw, peer) = tokio::io::duplex(1024);
        let (_tx, mut rx) = Box::new(StreamTransport::new(peer, None)).split();

        raw.write_all(&4u32.to_be_bytes()).await.unwrap();
        raw.write_all(&[0xff, 0xff, 0xff, 0xff]).await.unwrap();
        raw.write_all(&certion_proto::FrameCodec::encode(&TunnelFrame::Heartbeat).unwrap())
            .await
            .unwrap();

        let err = rx.recv_frame().await.unwrap_err();
        assert!(matches!(err, TransportError::MalformedFrame(_)));
        assert!(!err.is_fatal());

        assert_eq!(rx.recv_frame().await.unwrap(), Some(TunnelFrame::Heartbeat));
    }
}
