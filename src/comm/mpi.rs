use mpi::topology::SimpleCommunicator;
use mpi::traits::{Communicator, Destination, Root, Source};

use super::Transport;

/// MPI-backed transport over one communicator.
///
/// The master's fan-in phase issues receives from several worker ranks
/// concurrently, so the MPI library must be initialized with
/// `Threading::Multiple`:
///
/// ```ignore
/// let (universe, _) = mpi::initialize_with_threading(Threading::Multiple).unwrap();
/// let transport = MpiTransport::new(universe.world());
/// ```
pub struct MpiTransport {
    world: SimpleCommunicator,
}

impl MpiTransport {
    #[must_use]
    pub fn new(world: SimpleCommunicator) -> Self {
        Self { world }
    }
}

// Safety: all access goes through MPI calls, which are thread-safe under
// `Threading::Multiple`; the communicator itself is never mutated.
unsafe impl Sync for MpiTransport {}
unsafe impl Send for MpiTransport {}

impl Transport for MpiTransport {
    fn rank(&self) -> usize {
        self.world.rank() as usize
    }

    fn size(&self) -> usize {
        self.world.size() as usize
    }

    fn broadcast_bytes(&self, root: usize, data: &mut Vec<u8>) {
        let root = self.world.process_at_rank(root as i32);
        // Broadcast length, then payload (receivers size their buffer first).
        let mut len = if root.is_self() { data.len() } else { 0 };
        root.broadcast_into(&mut len);
        if !root.is_self() {
            data.resize(len, 0);
        }
        root.broadcast_into(&mut data[..]);
    }

    fn send_bytes(&self, dest: usize, tag: usize, data: &[u8]) {
        self.world
            .process_at_rank(dest as i32)
            .send_with_tag(data, tag as i32);
    }

    fn recv_bytes(&self, src: usize, tag: usize) -> Vec<u8> {
        let (data, _status) = self
            .world
            .process_at_rank(src as i32)
            .receive_vec_with_tag::<u8>(tag as i32);
        data
    }

    fn abort(&self, code: i32) -> ! {
        self.world.abort(code)
    }
}
