//! Rank partitioning and the gather/release collective
//!
//! Every rank extracts its share of patches into a [`RankMesh`], then the
//! root gathers all rank meshes, merges and writes them, and finally releases
//! the workers. A failing rank aborts the collective instead of leaving the
//! others blocked, and every blocking receive is bounded by a timeout.

use amrsurf_core::{Error, RankMesh, Result};
use flume::{Receiver, RecvTimeoutError, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Duration;

/// Rank that gathers, merges and writes
pub const ROOT: usize = 0;

/// Patch indices handled by `rank`: `rank, rank + size, rank + 2 * size, ...`
pub fn partition(patch_count: usize, rank: usize, size: usize) -> Vec<usize> {
    if size == 0 {
        return Vec::new();
    }
    (rank..patch_count).step_by(size).collect()
}

/// Settings shared by all ranks of a collective
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectiveConfig {
    /// Upper bound on any single blocking receive
    pub timeout: Duration,
}

impl Default for CollectiveConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
        }
    }
}

impl CollectiveConfig {
    /// Set the receive timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Message passing between the ranks of one extraction
pub trait Communicator {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn is_root(&self) -> bool {
        self.rank() == ROOT
    }

    /// Send the local mesh to the root. The root receives every rank's mesh
    /// in increasing rank order; workers get `None`.
    fn gather(&self, local: RankMesh) -> Result<Option<Vec<RankMesh>>>;

    /// Root only: tell every worker the snapshot completed
    fn release(&self) -> Result<()>;

    /// Workers only: block until the root releases or aborts
    fn wait_release(&self) -> Result<()>;

    /// Give up on the current collective, waking every waiting rank
    fn abort(&self, reason: &str);
}

/// Single-rank communicator
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialComm;

impl Communicator for SerialComm {
    fn rank(&self) -> usize {
        ROOT
    }

    fn size(&self) -> usize {
        1
    }

    fn gather(&self, local: RankMesh) -> Result<Option<Vec<RankMesh>>> {
        Ok(Some(vec![local]))
    }

    fn release(&self) -> Result<()> {
        Ok(())
    }

    fn wait_release(&self) -> Result<()> {
        Ok(())
    }

    fn abort(&self, reason: &str) {
        log::error!("Extraction aborted: {}", reason);
    }
}

#[derive(Debug)]
enum Message {
    Fragment(RankMesh),
    Abort { rank: usize, reason: String },
    Release,
}

#[derive(Debug)]
enum Link {
    Root {
        inbox: Receiver<Message>,
        /// Channel to rank `i + 1` at index `i`
        workers: Vec<Sender<Message>>,
    },
    Worker {
        to_root: Sender<Message>,
        from_root: Receiver<Message>,
    },
}

/// In-process rank joined to the others by channels
#[derive(Debug)]
pub struct LocalComm {
    rank: usize,
    size: usize,
    timeout: Duration,
    link: Link,
}

impl LocalComm {
    /// Create the communicators of a `size`-rank collective, indexed by rank
    pub fn create(size: usize, config: &CollectiveConfig) -> Result<Vec<LocalComm>> {
        if size == 0 {
            return Err(Error::Config("Collective needs at least one rank".to_string()));
        }

        let (to_root, inbox) = flume::unbounded();
        let mut workers = Vec::with_capacity(size - 1);
        let mut comms = Vec::with_capacity(size);
        for rank in 1..size {
            let (tx, rx) = flume::unbounded();
            workers.push(tx);
            comms.push(LocalComm {
                rank,
                size,
                timeout: config.timeout,
                link: Link::Worker {
                    to_root: to_root.clone(),
                    from_root: rx,
                },
            });
        }
        comms.insert(
            0,
            LocalComm {
                rank: ROOT,
                size,
                timeout: config.timeout,
                link: Link::Root { inbox, workers },
            },
        );
        Ok(comms)
    }

    fn broadcast_abort(workers: &[Sender<Message>], reason: &str) {
        for tx in workers {
            // A worker that already returned has dropped its receiver.
            let _ = tx.send(Message::Abort {
                rank: ROOT,
                reason: reason.to_string(),
            });
        }
    }

    fn fail(&self, workers: &[Sender<Message>], reason: String) -> Error {
        Self::broadcast_abort(workers, &reason);
        Error::Collective(reason)
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn gather(&self, local: RankMesh) -> Result<Option<Vec<RankMesh>>> {
        match &self.link {
            Link::Worker { to_root, .. } => {
                to_root
                    .send(Message::Fragment(local))
                    .map_err(|_| Error::Collective(format!("Rank {} lost the root", self.rank)))?;
                Ok(None)
            }
            Link::Root { inbox, workers } => {
                let mut meshes = Vec::with_capacity(self.size);
                meshes.push(local);
                while meshes.len() < self.size {
                    match inbox.recv_timeout(self.timeout) {
                        Ok(Message::Fragment(mesh)) => {
                            log::debug!(
                                "Root received {} vertices from rank {}",
                                mesh.vertex_count(),
                                mesh.rank
                            );
                            meshes.push(mesh);
                        }
                        Ok(Message::Abort { rank, reason }) => {
                            return Err(self.fail(
                                workers,
                                format!("Rank {} aborted: {}", rank, reason),
                            ));
                        }
                        Ok(Message::Release) => {
                            return Err(self.fail(
                                workers,
                                "Root received an unexpected release".to_string(),
                            ));
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            return Err(self.fail(
                                workers,
                                format!(
                                    "Timed out after {:?} with {} of {} rank meshes",
                                    self.timeout,
                                    meshes.len(),
                                    self.size
                                ),
                            ));
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            return Err(self.fail(
                                workers,
                                format!(
                                    "Workers disconnected with {} of {} rank meshes",
                                    meshes.len(),
                                    self.size
                                ),
                            ));
                        }
                    }
                }

                meshes.sort_by_key(|m| m.rank);
                if meshes.iter().enumerate().any(|(i, m)| m.rank != i) {
                    let ranks: Vec<usize> = meshes.iter().map(|m| m.rank).collect();
                    return Err(self.fail(
                        workers,
                        format!("Gathered inconsistent ranks {:?}", ranks),
                    ));
                }
                Ok(Some(meshes))
            }
        }
    }

    fn release(&self) -> Result<()> {
        match &self.link {
            Link::Root { workers, .. } => {
                for tx in workers {
                    let _ = tx.send(Message::Release);
                }
                Ok(())
            }
            Link::Worker { .. } => Err(Error::Collective(format!(
                "Rank {} cannot release the collective",
                self.rank
            ))),
        }
    }

    fn wait_release(&self) -> Result<()> {
        match &self.link {
            Link::Root { .. } => Ok(()),
            Link::Worker { from_root, .. } => match from_root.recv_timeout(self.timeout) {
                Ok(Message::Release) => Ok(()),
                Ok(Message::Abort { reason, .. }) => Err(Error::Collective(format!(
                    "Rank {} released by abort: {}",
                    self.rank, reason
                ))),
                Ok(Message::Fragment(_)) => Err(Error::Collective(format!(
                    "Rank {} received an unexpected fragment",
                    self.rank
                ))),
                Err(RecvTimeoutError::Timeout) => Err(Error::Collective(format!(
                    "Rank {} timed out after {:?} waiting for release",
                    self.rank, self.timeout
                ))),
                Err(RecvTimeoutError::Disconnected) => Err(Error::Collective(format!(
                    "Rank {} lost the root before release",
                    self.rank
                ))),
            },
        }
    }

    fn abort(&self, reason: &str) {
        log::error!("Rank {} aborting: {}", self.rank, reason);
        match &self.link {
            Link::Root { workers, .. } => Self::broadcast_abort(workers, reason),
            Link::Worker { to_root, .. } => {
                let _ = to_root.send(Message::Abort {
                    rank: self.rank,
                    reason: reason.to_string(),
                });
            }
        }
    }
}

/// Run `f` on `size` in-process ranks and return each rank's result.
///
/// A rank that panics aborts the collective and reports an error.
pub fn run_local<T, F>(size: usize, config: &CollectiveConfig, f: F) -> Result<Vec<Result<T>>>
where
    T: Send,
    F: Fn(&LocalComm) -> Result<T> + Sync,
{
    let comms = LocalComm::create(size, config)?;
    let f = &f;

    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(size);
        for comm in comms {
            let rank = comm.rank;
            let handle = thread::Builder::new()
                .name(format!("amrsurf-rank-{}", rank))
                .spawn_scoped(scope, move || {
                    match panic::catch_unwind(AssertUnwindSafe(|| f(&comm))) {
                        Ok(result) => result,
                        Err(_) => {
                            comm.abort("rank panicked");
                            Err(Error::Collective(format!("Rank {} panicked", rank)))
                        }
                    }
                })?;
            handles.push((rank, handle));
        }

        Ok(handles
            .into_iter()
            .map(|(rank, handle)| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(Error::Collective(format!("Rank {} panicked", rank))))
            })
            .collect())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use amrsurf_core::{MeshFragment, Point3d, SamplePlacement};
    use std::time::Instant;

    fn rank_mesh(rank: usize, vertices: usize) -> RankMesh {
        let mut mesh = RankMesh::new(rank, SamplePlacement::Node);
        let fragment = MeshFragment {
            vertices: (0..vertices).map(|i| Point3d::new(i as f64, 0.0, 0.0)).collect(),
            faces: Vec::new(),
            values: vec![rank as f64; vertices],
            placement: SamplePlacement::Node,
        };
        mesh.append(fragment).unwrap();
        mesh
    }

    #[test]
    fn test_partition_round_robin() {
        assert_eq!(partition(10, 0, 3), vec![0, 3, 6, 9]);
        assert_eq!(partition(10, 1, 3), vec![1, 4, 7]);
        assert_eq!(partition(10, 2, 3), vec![2, 5, 8]);
        assert_eq!(partition(2, 3, 4), Vec::<usize>::new());
        assert_eq!(partition(5, 0, 1), vec![0, 1, 2, 3, 4]);

        let mut all: Vec<usize> = (0..4).flat_map(|r| partition(17, r, 4)).collect();
        all.sort();
        assert_eq!(all, (0..17).collect::<Vec<_>>());
    }

    #[test]
    fn test_serial_comm() {
        let comm = SerialComm;
        assert!(comm.is_root());
        let gathered = comm.gather(rank_mesh(0, 2)).unwrap().unwrap();
        assert_eq!(gathered.len(), 1);
        assert!(comm.release().is_ok());
        assert!(comm.wait_release().is_ok());
    }

    #[test]
    fn test_local_gather_in_rank_order() {
        let config = CollectiveConfig::default().with_timeout(Duration::from_secs(10));
        let results = run_local(4, &config, |comm| {
            let gathered = comm.gather(rank_mesh(comm.rank(), comm.rank() + 1))?;
            if comm.is_root() {
                comm.release()?;
            } else {
                comm.wait_release()?;
            }
            Ok(gathered.map(|meshes| meshes.iter().map(|m| m.rank).collect::<Vec<_>>()))
        })
        .unwrap();

        assert_eq!(results.len(), 4);
        let root = results[0].as_ref().unwrap();
        assert_eq!(root.as_deref(), Some(&[0, 1, 2, 3][..]));
        for result in &results[1..] {
            assert_eq!(result.as_ref().unwrap(), &None);
        }
    }

    #[test]
    fn test_abort_wakes_every_rank() {
        let config = CollectiveConfig::default().with_timeout(Duration::from_secs(30));
        let start = Instant::now();
        let results = run_local(3, &config, |comm| {
            if comm.rank() == 2 {
                comm.abort("synthetic failure");
                return Err(Error::Algorithm("synthetic failure".to_string()));
            }
            comm.gather(rank_mesh(comm.rank(), 1))?;
            if comm.is_root() {
                comm.release()?;
            } else {
                comm.wait_release()?;
            }
            Ok(())
        })
        .unwrap();

        assert!(results.iter().all(|r| r.is_err()));
        assert!(start.elapsed() < Duration::from_secs(10));
        match &results[0] {
            Err(Error::Collective(msg)) => assert!(msg.contains("Rank 2")),
            other => panic!("unexpected root result: {:?}", other.as_ref().map(|_| ())),
        }
    }

    #[test]
    fn test_missing_rank_times_out() {
        let config = CollectiveConfig::default().with_timeout(Duration::from_millis(200));
        let results = run_local(2, &config, |comm| {
            if comm.is_root() {
                comm.gather(rank_mesh(0, 1))?;
            } else {
                // Hold the channel open without ever sending
                std::thread::sleep(Duration::from_millis(600));
            }
            Ok(())
        })
        .unwrap();

        assert!(matches!(results[0], Err(Error::Collective(_))));
        assert!(results[1].is_ok());
    }

    #[test]
    fn test_panicking_rank_aborts() {
        let config = CollectiveConfig::default().with_timeout(Duration::from_secs(30));
        let results = run_local(2, &config, |comm| {
            if comm.rank() == 1 {
                panic!("worker exploded");
            }
            comm.gather(rank_mesh(0, 1))?;
            Ok(())
        })
        .unwrap();
        assert!(results.iter().all(|r| r.is_err()));
    }

    #[test]
    fn test_zero_ranks_rejected() {
        let config = CollectiveConfig::default();
        assert!(run_local(0, &config, |_| Ok(())).is_err());
    }
}
