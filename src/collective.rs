//! Collective communication between SPMD workers.
//!
//! Every worker runs the same program and must issue the same collectives in
//! the same order. [`LocalGroup`] simulates a group of workers inside one
//! process (one thread per rank) and tags every call with a [`Fingerprint`],
//! so a divergent call sequence fails with [`D2Error::ProtocolMismatch`] on
//! every rank instead of hanging.

use crate::error::{D2Error, Result};
use std::cell::Cell;
use std::fmt;
use std::sync::{Arc, Barrier, Mutex};

/// Blocking collective operations over a fixed group of workers.
pub trait Collective {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Elementwise sum across all workers, result replicated everywhere.
    fn allreduce_sum(&self, buf: &mut [f64]) -> Result<()>;

    /// Replace `buf` on every worker with the owner's `buf`.
    fn broadcast(&self, buf: &mut [f64], owner: usize) -> Result<()>;

    fn barrier(&self) -> Result<()>;

    fn allreduce_scalar(&self, value: f64) -> Result<f64> {
        let mut buf = [value];
        self.allreduce_sum(&mut buf)?;
        Ok(buf[0])
    }
}

/// A group of one.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn allreduce_sum(&self, _buf: &mut [f64]) -> Result<()> {
        Ok(())
    }

    fn broadcast(&self, _buf: &mut [f64], owner: usize) -> Result<()> {
        if owner != 0 {
            return Err(D2Error::collective(format!(
                "broadcast owner {owner} outside a world of 1"
            )));
        }
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectiveOp {
    AllReduceSum,
    Broadcast,
    Barrier,
}

/// Identity of one collective call within a worker's call sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub seq: u64,
    pub op: CollectiveOp,
    pub len: usize,
    pub owner: Option<usize>,
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {:?}[{}]", self.seq, self.op, self.len)?;
        if let Some(owner) = self.owner {
            write!(f, " from {owner}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Slot {
    fingerprint: Option<Fingerprint>,
    data: Vec<f64>,
}

struct Shared {
    world: usize,
    barrier: Barrier,
    slots: Mutex<Vec<Slot>>,
}

/// Factory for in-process worker handles.
pub struct LocalGroup;

impl LocalGroup {
    /// One handle per rank; move each into its own thread.
    pub fn new(world: usize) -> Result<Vec<LocalWorker>> {
        if world == 0 {
            return Err(D2Error::invalid_parameter("world", "must be > 0"));
        }
        let shared = Arc::new(Shared {
            world,
            barrier: Barrier::new(world),
            slots: Mutex::new(vec![
                Slot {
                    fingerprint: None,
                    data: Vec::new(),
                };
                world
            ]),
        });
        Ok((0..world)
            .map(|rank| LocalWorker {
                rank,
                shared: Arc::clone(&shared),
                seq: Cell::new(0),
            })
            .collect())
    }
}

/// One simulated rank of a [`LocalGroup`].
pub struct LocalWorker {
    rank: usize,
    shared: Arc<Shared>,
    seq: Cell<u64>,
}

impl LocalWorker {
    fn next_fingerprint(&self, op: CollectiveOp, len: usize, owner: Option<usize>) -> Fingerprint {
        let seq = self.seq.get();
        self.seq.set(seq + 1);
        Fingerprint { seq, op, len, owner }
    }

    /// Publish this rank's contribution, wait for the group, then return
    /// every rank's slot after checking all fingerprints agree.
    fn exchange(&self, fingerprint: Fingerprint, payload: &[f64]) -> Result<Vec<Slot>> {
        {
            let mut slots = self
                .shared
                .slots
                .lock()
                .map_err(|_| D2Error::collective("slot table poisoned"))?;
            slots[self.rank] = Slot {
                fingerprint: Some(fingerprint),
                data: payload.to_vec(),
            };
        }
        self.shared.barrier.wait();
        let snapshot = self
            .shared
            .slots
            .lock()
            .map_err(|_| D2Error::collective("slot table poisoned"))?
            .clone();
        // nobody may overwrite a slot until every rank has read the table
        self.shared.barrier.wait();

        for slot in &snapshot {
            if slot.fingerprint != Some(fingerprint) {
                return Err(D2Error::ProtocolMismatch {
                    rank: self.rank,
                    expected: fingerprint.to_string(),
                    got: slot
                        .fingerprint
                        .map(|f| f.to_string())
                        .unwrap_or_else(|| "nothing".to_string()),
                });
            }
        }
        Ok(snapshot)
    }
}

impl Collective for LocalWorker {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world
    }

    fn allreduce_sum(&self, buf: &mut [f64]) -> Result<()> {
        let fingerprint = self.next_fingerprint(CollectiveOp::AllReduceSum, buf.len(), None);
        let slots = self.exchange(fingerprint, buf)?;
        buf.fill(0.0);
        // rank order keeps the sum bit-identical on every worker
        for slot in &slots {
            for (acc, v) in buf.iter_mut().zip(&slot.data) {
                *acc += v;
            }
        }
        Ok(())
    }

    fn broadcast(&self, buf: &mut [f64], owner: usize) -> Result<()> {
        if owner >= self.shared.world {
            return Err(D2Error::collective(format!(
                "broadcast owner {owner} outside a world of {}",
                self.shared.world
            )));
        }
        let fingerprint = self.next_fingerprint(CollectiveOp::Broadcast, buf.len(), Some(owner));
        let payload: &[f64] = if self.rank == owner { &buf[..] } else { &[] };
        let slots = self.exchange(fingerprint, payload)?;
        buf.copy_from_slice(&slots[owner].data);
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        let fingerprint = self.next_fingerprint(CollectiveOp::Barrier, 0, None);
        self.exchange(fingerprint, &[]).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run<T: Send>(world: usize, f: impl Fn(&LocalWorker) -> T + Sync) -> Vec<T> {
        let workers = LocalGroup::new(world).unwrap();
        thread::scope(|s| {
            let handles: Vec<_> = workers
                .into_iter()
                .map(|w| {
                    let f = &f;
                    s.spawn(move || f(&w))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn test_single_process_is_identity() {
        let comm = SingleProcess;
        let mut buf = [1.0, 2.0];
        comm.allreduce_sum(&mut buf).unwrap();
        assert_eq!(buf, [1.0, 2.0]);
        assert!(comm.broadcast(&mut buf, 1).is_err());
    }

    #[test]
    fn test_allreduce_and_broadcast() {
        let out = run(4, |w| {
            let mut sum = [w.rank() as f64, 1.0];
            w.allreduce_sum(&mut sum).unwrap();
            let mut owned = [w.rank() as f64 * 10.0];
            w.broadcast(&mut owned, 2).unwrap();
            w.barrier().unwrap();
            (sum, owned[0])
        });
        for (sum, owned) in out {
            assert_eq!(sum, [6.0, 4.0]);
            assert_eq!(owned, 20.0);
        }
    }

    #[test]
    fn test_mismatched_calls_are_reported() {
        let out = run(2, |w| {
            let mut buf = vec![1.0; w.rank() + 1];
            w.allreduce_sum(&mut buf)
        });
        for result in out {
            assert!(matches!(result, Err(D2Error::ProtocolMismatch { .. })));
        }
    }

    #[test]
    fn test_local_worker_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<LocalWorker>();
    }
}
