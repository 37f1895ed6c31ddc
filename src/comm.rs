//! Master/slave communication: the order protocol and the message-passing
//! transports it runs over.
//!
//! The control channel is a closed tagged-union message type ([`Order`])
//! broadcast from the master; heavy payloads move as serialized byte blobs
//! over collective broadcasts and tagged point-to-point messages. Control
//! messages master→slave use tag `2 * slave_rank`; data payloads slave→master
//! are tagged by their task index, so multiple logical channels multiplex
//! over one communicator without ambiguity.

pub mod channel;
#[cfg(feature = "mpi")]
pub mod mpi;
pub mod order;
pub mod serialization;

use serde::{de::DeserializeOwned, Serialize};

use crate::blocksparse::BlockTensor;
use crate::types::Scalar;

use self::serialization::{deserialize, serialize};

pub use self::channel::ChannelTransport;
pub use self::order::Order;

/// The rank that owns orchestration, sweep state and disk I/O.
pub const MASTER_RANK: usize = 0;

/// Byte-level message passing between a fixed set of ranks.
///
/// Collective broadcasts block until the payload is available on every
/// participating rank; there is no timeout and no cancellation. A failure on
/// any rank takes the whole job down via [`Transport::abort`].
pub trait Transport: Send + Sync {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    /// Broadcasts `data` from `root` to all ranks. Receivers may pass an
    /// empty vector; it is replaced with the payload.
    fn broadcast_bytes(&self, root: usize, data: &mut Vec<u8>);

    fn send_bytes(&self, dest: usize, tag: usize, data: &[u8]);

    fn recv_bytes(&self, src: usize, tag: usize) -> Vec<u8>;

    /// Terminates the whole distributed job. Reserved for fatal protocol
    /// errors; there is no partial-result salvage.
    fn abort(&self, code: i32) -> !;
}

/// Broadcast a value by serializing it and sending it as a byte array.
/// Receivers can pass any placeholder (e.g. `Default::default()`).
pub fn broadcast_serializing<T>(tp: &dyn Transport, root: usize, data: T) -> T
where
    T: Serialize + DeserializeOwned,
{
    let mut raw = if tp.rank() == root {
        serialize(&data)
    } else {
        Vec::new()
    };
    tp.broadcast_bytes(root, &mut raw);
    if tp.rank() == root {
        data
    } else {
        deserialize(&raw)
    }
}

pub fn send_value<T: Serialize>(tp: &dyn Transport, dest: usize, tag: usize, value: &T) {
    tp.send_bytes(dest, tag, &serialize(value));
}

#[must_use]
pub fn recv_value<T: DeserializeOwned>(tp: &dyn Transport, src: usize, tag: usize) -> T {
    deserialize(&tp.recv_bytes(src, tag))
}

/// Sends a block-sparse tensor to `dest`, tagged by `tag`.
pub fn send_tensor<S: Scalar>(
    tp: &dyn Transport,
    dest: usize,
    tag: usize,
    tensor: &BlockTensor<S>,
) {
    send_value(tp, dest, tag, tensor);
}

#[must_use]
pub fn recv_tensor<S: Scalar>(tp: &dyn Transport, src: usize, tag: usize) -> BlockTensor<S> {
    recv_value(tp, src, tag)
}

/// Broadcasts a tensor from `root`; receivers reconstruct it from the wire.
pub fn broadcast_tensor<S: Scalar>(
    tp: &dyn Transport,
    root: usize,
    tensor: Option<BlockTensor<S>>,
) -> BlockTensor<S> {
    let mut raw = if tp.rank() == root {
        serialize(tensor.as_ref().expect("root must provide the tensor"))
    } else {
        Vec::new()
    };
    tp.broadcast_bytes(root, &mut raw);
    if tp.rank() == root {
        tensor.unwrap()
    } else {
        deserialize(&raw)
    }
}

/// Master-side order broadcast. The wire format is the raw order code so that
/// slaves can tolerate codes they do not understand.
pub fn master_broadcast_order(tp: &dyn Transport, order: Order) {
    debug_assert_eq!(tp.rank(), MASTER_RANK);
    broadcast_serializing(tp, MASTER_RANK, order.code());
}

/// Slave-side blocking receive of the next order. Returns `None` for codes
/// outside the known set; callers log and ignore those.
#[must_use]
pub fn slave_get_broadcast_order(tp: &dyn Transport) -> Option<Order> {
    let code = broadcast_serializing::<u32>(tp, MASTER_RANK, 0);
    Order::from_code(code)
}
