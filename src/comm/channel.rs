use crossbeam::channel::{unbounded, Receiver, Sender};
use log::error;

use super::Transport;

type Message = (usize, Vec<u8>);

/// Tag reserved for collective broadcasts.
const BCAST_TAG: usize = usize::MAX;

/// An in-process transport: a full mesh of FIFO channels between `size`
/// ranks, each rank typically living on its own thread.
///
/// Point-to-point messages between a rank pair are ordered; the tag carried
/// with each message is checked against the receiver's expectation, so any
/// protocol drift fails loudly instead of silently crossing streams.
pub struct ChannelTransport {
    rank: usize,
    txs: Vec<Sender<Message>>,
    rxs: Vec<Receiver<Message>>,
}

impl ChannelTransport {
    /// Builds the endpoints of a `size`-rank world. Endpoint `r` of the
    /// returned vector belongs to rank `r`.
    #[must_use]
    pub fn mesh(size: usize) -> Vec<ChannelTransport> {
        assert!(size > 0);
        let mut txs: Vec<Vec<Sender<Message>>> = (0..size).map(|_| Vec::new()).collect();
        let mut rxs: Vec<Vec<Receiver<Message>>> = (0..size).map(|_| Vec::new()).collect();
        for src in 0..size {
            for dst in 0..size {
                let (tx, rx) = unbounded();
                txs[src].push(tx);
                rxs[dst].push(rx);
            }
        }
        txs.into_iter()
            .zip(rxs)
            .enumerate()
            .map(|(rank, (txs, rxs))| ChannelTransport { rank, txs, rxs })
            .collect()
    }
}

impl Transport for ChannelTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.txs.len()
    }

    fn broadcast_bytes(&self, root: usize, data: &mut Vec<u8>) {
        if self.rank == root {
            for dst in 0..self.size() {
                if dst != root {
                    self.txs[dst]
                        .send((BCAST_TAG, data.clone()))
                        .expect("broadcast receiver hung up");
                }
            }
        } else {
            let (tag, payload) = self.rxs[root].recv().expect("broadcast sender hung up");
            assert_eq!(tag, BCAST_TAG, "expected a broadcast, got tag {tag}");
            *data = payload;
        }
    }

    fn send_bytes(&self, dest: usize, tag: usize, data: &[u8]) {
        self.txs[dest]
            .send((tag, data.to_vec()))
            .expect("receiver hung up");
    }

    fn recv_bytes(&self, src: usize, tag: usize) -> Vec<u8> {
        let (got, payload) = self.rxs[src].recv().expect("sender hung up");
        assert_eq!(got, tag, "tag mismatch on message from rank {src}");
        payload
    }

    fn abort(&self, code: i32) -> ! {
        error!(rank = self.rank, code; "transport abort");
        panic!("rank {} aborted the job with code {code}", self.rank);
    }
}
