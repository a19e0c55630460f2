//! Process-wide registries: processes keyed by pid, ports keyed by
//! `(pid, port_id)`. The C original uses a level-hash trie parameterized by
//! a protocol descriptor; this crate keeps the spec's naming but renders
//! the protocol as a typed `HashMap` whose hasher is MurmurHash2 over the
//! raw key bytes (the same hash function §4.3 names), giving the same
//! bit-level key framing without hand-rolling a trie.

use std::collections::HashMap;
use std::hash::{BuildHasherDefault, Hasher};
use std::sync::RwLock;

use tracing::{debug, warn};

pub type Pid = i32;
pub type PortId = u32;

/// MurmurHash2, matching `nxt_murmur_hash2` in the source this crate is
/// grounded on. Only ever fed 4 or 8 raw key bytes here, so the 32-bit
/// variant is sufficient. `(Pid, PortId)` keys reach `write()` twice (the
/// derived tuple `Hash` impl calls it once per field), so each call seeds
/// its mix from the previously accumulated state rather than a fixed
/// constant — otherwise the second call would simply clobber the first and
/// `pid`'s contribution would vanish from the final hash.
#[derive(Default)]
pub struct MurmurHash2(u64);

impl Hasher for MurmurHash2 {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        const M: u32 = 0x5bd1e995;

        let mut h: u32 = (self.0 as u32) ^ (bytes.len() as u32);
        let mut chunks = bytes.chunks_exact(4);

        for chunk in &mut chunks {
            let mut k = u32::from_le_bytes(chunk.try_into().unwrap());
            k = k.wrapping_mul(M);
            k ^= k >> 24;
            k = k.wrapping_mul(M);
            h = h.wrapping_mul(M);
            h ^= k;
        }

        let remainder = chunks.remainder();
        let mut tail = [0u8; 4];
        tail[..remainder.len()].copy_from_slice(remainder);
        match remainder.len() {
            3 => {
                h ^= (tail[2] as u32) << 16;
                h ^= (tail[1] as u32) << 8;
                h ^= tail[0] as u32;
                h = h.wrapping_mul(M);
            }
            2 => {
                h ^= (tail[1] as u32) << 8;
                h ^= tail[0] as u32;
                h = h.wrapping_mul(M);
            }
            1 => {
                h ^= tail[0] as u32;
                h = h.wrapping_mul(M);
            }
            _ => {}
        }

        h ^= h >> 13;
        h = h.wrapping_mul(M);
        h ^= h >> 15;

        self.0 = h as u64;
    }
}

type MurmurHasher = BuildHasherDefault<MurmurHash2>;

/// A single IPC endpoint belonging to a process, identified by
/// `(pid, port_id)`. Backend-specific fields are intentionally absent: the
/// core only tracks identity and membership, not transport state.
#[derive(Debug, Clone)]
pub struct Port {
    pub pid: Pid,
    pub port_id: PortId,
}

/// A managed child process: pid plus the set of ports reachable on it.
#[derive(Debug, Clone)]
pub struct Process {
    pub pid: Pid,
    pub ports: Vec<Port>,
}

impl Process {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            ports: Vec::new(),
        }
    }
}

/// The process registry: processes keyed by pid, with master-process and
/// count bookkeeping per §4.3's invariants.
#[derive(Default)]
pub struct ProcessRegistry {
    inner: RwLock<ProcessRegistryInner>,
}

#[derive(Default)]
struct ProcessRegistryInner {
    processes: HashMap<Pid, Process, MurmurHasher>,
    mprocess: Option<Pid>,
    nprocesses: usize,
    insertion_order: Vec<Pid>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read-only lookup.
    pub fn find(&self, pid: Pid) -> Option<Process> {
        self.inner.read().unwrap().processes.get(&pid).cloned()
    }

    /// Looks up `pid`; if absent, creates and inserts a new `Process`. If
    /// the registry was empty before this insert, the new process is
    /// designated `mprocess` and `nprocesses` is incremented either way.
    pub fn get_or_new(&self, pid: Pid) -> Process {
        let mut inner = self.inner.write().unwrap();

        if let Some(existing) = inner.processes.get(&pid) {
            debug!(pid, "process found");
            return existing.clone();
        }

        let process = Process::new(pid);
        inner.processes.insert(pid, process.clone());

        if inner.nprocesses == 0 {
            inner.mprocess = Some(pid);
        }
        inner.nprocesses += 1;
        inner.insertion_order.push(pid);

        debug!(pid, "process insert");
        process
    }

    /// Inserts an already-constructed `Process`, mirroring its ports into
    /// the caller-supplied port registry. Insert failures (pid already
    /// present) are logged at warn and swallowed: the caller retains
    /// ownership and must re-query if it needs the canonical entry.
    pub fn add(&self, process: Process, ports: &PortRegistry) {
        let mut inner = self.inner.write().unwrap();

        if inner.processes.contains_key(&process.pid) {
            warn!(pid = process.pid, "process add failed: already present");
            return;
        }

        if inner.nprocesses == 0 {
            inner.mprocess = Some(process.pid);
        }
        inner.nprocesses += 1;
        inner.insertion_order.push(process.pid);

        for port in &process.ports {
            ports.add(port.clone());
        }

        inner.processes.insert(process.pid, process);
    }

    /// Removes `pid` and every port it owns from `ports`.
    pub fn remove(&self, pid: Pid, ports: &PortRegistry) {
        let mut inner = self.inner.write().unwrap();

        if let Some(process) = inner.processes.remove(&pid) {
            inner.nprocesses -= 1;
            inner.insertion_order.retain(|&p| p != pid);
            if inner.mprocess == Some(pid) {
                inner.mprocess = inner.insertion_order.first().copied();
            }

            for port in &process.ports {
                ports.remove(port.pid, port.port_id);
            }
        }
    }

    pub fn nprocesses(&self) -> usize {
        self.inner.read().unwrap().nprocesses
    }

    pub fn mprocess(&self) -> Option<Pid> {
        self.inner.read().unwrap().mprocess
    }

    /// Restartable, lazy-in-spirit snapshot traversal of all live entries.
    /// Callers must not mutate the registry while holding the returned
    /// vector's borrow window open (the snapshot is taken eagerly to avoid
    /// holding the lock across iteration, which is the Rust-idiomatic
    /// rendering of "restartable from a fresh iterator state").
    pub fn iter(&self) -> Vec<Process> {
        self.inner
            .read()
            .unwrap()
            .processes
            .values()
            .cloned()
            .collect()
    }
}

/// The port registry: ports keyed by `(pid, port_id)`.
#[derive(Default)]
pub struct PortRegistry {
    inner: RwLock<HashMap<(Pid, PortId), Port, MurmurHasher>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, pid: Pid, port_id: PortId) -> Option<Port> {
        self.inner.read().unwrap().get(&(pid, port_id)).cloned()
    }

    pub fn add(&self, port: Port) {
        let mut inner = self.inner.write().unwrap();
        let key = (port.pid, port.port_id);
        if inner.contains_key(&key) {
            warn!(
                pid = port.pid,
                port_id = port.port_id,
                "port add failed: already present"
            );
            return;
        }
        inner.insert(key, port);
    }

    pub fn remove(&self, pid: Pid, port_id: PortId) {
        self.inner.write().unwrap().remove(&(pid, port_id));
    }

    pub fn iter(&self) -> Vec<Port> {
        self.inner.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_new_is_idempotent_and_sets_mprocess_once() {
        let registry = ProcessRegistry::new();

        let first = registry.get_or_new(100);
        assert_eq!(registry.mprocess(), Some(100));
        assert_eq!(registry.nprocesses(), 1);

        let second = registry.get_or_new(100);
        assert_eq!(first.pid, second.pid);
        assert_eq!(registry.nprocesses(), 1);

        registry.get_or_new(200);
        assert_eq!(registry.mprocess(), Some(100));
        assert_eq!(registry.nprocesses(), 2);
    }

    #[test]
    fn add_remove_round_trip_is_observationally_unchanged() {
        let processes = ProcessRegistry::new();
        let ports = PortRegistry::new();

        let mut process = Process::new(42);
        process.ports.push(Port {
            pid: 42,
            port_id: 1,
        });

        processes.add(process.clone(), &ports);
        assert_eq!(processes.nprocesses(), 1);
        assert_eq!(ports.len(), 1);
        assert!(ports.find(42, 1).is_some());

        processes.remove(42, &ports);
        assert_eq!(processes.nprocesses(), 0);
        assert_eq!(ports.len(), 0);
        assert!(ports.find(42, 1).is_none());
    }

    #[test]
    fn every_port_has_a_process() {
        let processes = ProcessRegistry::new();
        let ports = PortRegistry::new();

        let mut process = Process::new(7);
        process.ports.push(Port { pid: 7, port_id: 3 });
        processes.add(process, &ports);

        for port in ports.iter() {
            let owner = processes.find(port.pid);
            assert!(owner.is_some());
            assert!(owner.unwrap().ports.iter().any(|p| p.port_id == port.port_id));
        }
    }

    #[test]
    fn nprocesses_matches_iterator_count() {
        let registry = ProcessRegistry::new();
        registry.get_or_new(1);
        registry.get_or_new(2);
        registry.get_or_new(3);

        assert_eq!(registry.nprocesses(), registry.iter().len());
    }

    #[test]
    fn insert_failure_is_swallowed_not_propagated() {
        let processes = ProcessRegistry::new();
        let ports = PortRegistry::new();

        processes.add(Process::new(5), &ports);
        // Second insert of the same pid is a silent warn + no-op, not a
        // panic or error return; the caller can re-query.
        processes.add(Process::new(5), &ports);
        assert_eq!(processes.nprocesses(), 1);
    }

    #[test]
    fn murmur_hash_is_deterministic() {
        let mut a = MurmurHash2::default();
        a.write(&42i32.to_le_bytes());
        let mut b = MurmurHash2::default();
        b.write(&42i32.to_le_bytes());
        assert_eq!(a.finish(), b.finish());
    }

    #[test]
    fn murmur_hash_mixes_every_write_call() {
        // (pid, port_id) keys reach write() twice, once per field. Both
        // calls must shape the final hash, or distinct pids sharing a
        // port_id would collide.
        let mut a = MurmurHash2::default();
        a.write(&1i32.to_le_bytes());
        a.write(&7u32.to_le_bytes());

        let mut b = MurmurHash2::default();
        b.write(&2i32.to_le_bytes());
        b.write(&7u32.to_le_bytes());

        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn port_registry_does_not_collide_across_pids_sharing_a_port_id() {
        let ports = PortRegistry::new();
        ports.add(Port { pid: 1, port_id: 7 });
        ports.add(Port { pid: 2, port_id: 7 });

        assert_eq!(ports.len(), 2);
        assert_eq!(ports.find(1, 7).unwrap().pid, 1);
        assert_eq!(ports.find(2, 7).unwrap().pid, 2);
    }
}
