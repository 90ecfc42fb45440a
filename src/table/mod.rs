//! Fixed-capacity process table shared between the supervisor and its workers
//!
//! The table lives in a `memfd` mapped `MAP_SHARED` before the first fork,
//! so every worker inherits the same physical pages and sees writes made by
//! any other process. Layout:
//!
//! ```text
//! +--------+--------+--------+-----+-------------------+
//! | header | slot 0 | slot 1 | ... | slot capacity - 1 |
//! +--------+--------+--------+-----+-------------------+
//! ```
//!
//! The header holds a spin lock whose word is the pid of the holder (0 when
//! free). Every operation takes the lock for the duration of a slot copy, so
//! critical sections are a few hundred bytes of memcpy. A lock held by a
//! process that has died (including one not yet reaped) is reclaimed.
//!
//! A slot with pid 0 is free. Names and metadata live in fixed-size columns;
//! metadata is stored as JSON.

mod record;

pub use record::{ProcessRecord, ProcessStatus};

use crate::error::TableError;
use crate::transport::TransportKind;
use chrono::{DateTime, Utc};
use memmap2::{MmapOptions, MmapRaw};
use nix::errno::Errno;
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::sys::signal::kill;
use nix::sys::wait::{waitid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::{getpid, Pid};
use std::ffi::CString;
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::mem::{align_of, size_of};
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::warn;

/// Bytes available for a worker name
pub const NAME_CAPACITY: usize = 128;

/// Bytes available for a record's JSON-encoded metadata
pub const METADATA_CAPACITY: usize = 512;

/// Busy-wait iterations before the lock starts yielding the CPU
const SPINS_BEFORE_YIELD: u32 = 64;

/// Yields between two liveness checks of the lock holder
const YIELDS_PER_LIVENESS_CHECK: u32 = 1024;

#[repr(C)]
struct Header {
    lock: AtomicI32,
    capacity: AtomicU32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Slot {
    pid: i32,
    status: u8,
    transport: u8,
    name_len: u16,
    metadata_len: u16,
    started_at_ms: i64,
    name: [u8; NAME_CAPACITY],
    metadata: [u8; METADATA_CAPACITY],
}

impl Slot {
    const FREE: Slot = Slot {
        pid: 0,
        status: 0,
        transport: 0,
        name_len: 0,
        metadata_len: 0,
        started_at_ms: 0,
        name: [0; NAME_CAPACITY],
        metadata: [0; METADATA_CAPACITY],
    };

    fn encode(record: &ProcessRecord) -> Result<Self, TableError> {
        if record.pid <= 0 {
            return Err(TableError::InvalidPid(record.pid));
        }

        let name = record.name.as_bytes();
        if name.len() > NAME_CAPACITY {
            return Err(TableError::FieldTooLarge {
                field: "name",
                len: name.len(),
                max: NAME_CAPACITY,
            });
        }

        let metadata = serde_json::to_vec(&record.metadata).map_err(TableError::Metadata)?;
        if metadata.len() > METADATA_CAPACITY {
            return Err(TableError::FieldTooLarge {
                field: "metadata",
                len: metadata.len(),
                max: METADATA_CAPACITY,
            });
        }

        let mut slot = Slot::FREE;
        slot.pid = record.pid;
        slot.status = record.status.as_u8();
        slot.transport = record.transport.as_u8();
        slot.name_len = name.len() as u16;
        slot.metadata_len = metadata.len() as u16;
        slot.started_at_ms = record.started_at.timestamp_millis();
        slot.name[..name.len()].copy_from_slice(name);
        slot.metadata[..metadata.len()].copy_from_slice(&metadata);
        Ok(slot)
    }

    fn decode(&self) -> ProcessRecord {
        let name_len = usize::from(self.name_len).min(NAME_CAPACITY);
        let metadata_len = usize::from(self.metadata_len).min(METADATA_CAPACITY);

        ProcessRecord {
            pid: self.pid,
            name: String::from_utf8_lossy(&self.name[..name_len]).into_owned(),
            status: ProcessStatus::from_u8(self.status).unwrap_or(ProcessStatus::Stopped),
            started_at: DateTime::<Utc>::from_timestamp_millis(self.started_at_ms)
                .unwrap_or_default(),
            transport: TransportKind::from_u8(self.transport).unwrap_or(TransportKind::Standard),
            metadata: serde_json::from_slice(&self.metadata[..metadata_len]).unwrap_or_default(),
        }
    }
}

const SLOTS_OFFSET: usize = size_of::<Header>().div_ceil(align_of::<Slot>()) * align_of::<Slot>();

/// Shared registry mapping pid to [`ProcessRecord`]
///
/// Cloning is cheap and every clone (and every forked child holding one)
/// refers to the same memory.
#[derive(Clone)]
pub struct ProcessTable {
    map: Arc<MmapRaw>,
    capacity: usize,
}

impl ProcessTable {
    /// Map a new, empty table able to hold `capacity` records
    pub fn new(capacity: usize) -> Result<Self, TableError> {
        if capacity == 0 {
            return Err(TableError::ZeroCapacity);
        }

        let len = SLOTS_OFFSET + capacity * size_of::<Slot>();
        let map = shared_mapping(len).map_err(TableError::Map)?;
        let table = Self {
            map: Arc::new(map),
            capacity,
        };
        table
            .header()
            .capacity
            .store(capacity as u32, Ordering::Release);

        Ok(table)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert or overwrite the record keyed by `record.pid`
    pub fn put(&self, record: &ProcessRecord) -> Result<(), TableError> {
        let slot = Slot::encode(record)?;
        let guard = self.lock();

        let index = match guard.find(record.pid) {
            Some(index) => index,
            None => guard.find_free().ok_or(TableError::Full {
                capacity: self.capacity,
            })?,
        };
        guard.write(index, &slot);
        Ok(())
    }

    /// Check that `record` fits a slot without writing it
    pub fn validate(&self, record: &ProcessRecord) -> Result<(), TableError> {
        Slot::encode(record).map(|_| ())
    }

    pub fn get(&self, pid: i32) -> Option<ProcessRecord> {
        let guard = self.lock();
        guard.find(pid).map(|index| guard.read(index).decode())
    }

    pub fn contains(&self, pid: i32) -> bool {
        self.lock().find(pid).is_some()
    }

    /// Remove a record, returning it if it was present
    pub fn remove(&self, pid: i32) -> Option<ProcessRecord> {
        let guard = self.lock();
        let index = guard.find(pid)?;
        let record = guard.read(index).decode();
        guard.write(index, &Slot::FREE);
        Some(record)
    }

    /// Read-modify-write a record under the table lock
    ///
    /// Returns `Ok(false)` when no record exists for `pid`. The pid itself
    /// cannot be changed through `f`.
    pub fn update<F>(&self, pid: i32, f: F) -> Result<bool, TableError>
    where
        F: FnOnce(&mut ProcessRecord),
    {
        let guard = self.lock();
        let Some(index) = guard.find(pid) else {
            return Ok(false);
        };

        let mut record = guard.read(index).decode();
        f(&mut record);
        record.pid = pid;
        let slot = Slot::encode(&record)?;
        guard.write(index, &slot);
        Ok(true)
    }

    /// Snapshot of every record, in no particular order
    pub fn scan(&self) -> Vec<ProcessRecord> {
        let guard = self.lock();
        (0..self.capacity)
            .map(|index| guard.read(index))
            .filter(|slot| slot.pid != 0)
            .map(|slot| slot.decode())
            .collect()
    }

    pub fn len(&self) -> usize {
        let guard = self.lock();
        (0..self.capacity)
            .filter(|&index| guard.read(index).pid != 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn header(&self) -> &Header {
        // SAFETY: the mapping is page aligned, at least SLOTS_OFFSET bytes
        // long and zero-initialised, which is a valid Header.
        unsafe { &*(self.map.as_ptr() as *const Header) }
    }

    fn slot_ptr(&self, index: usize) -> *mut Slot {
        debug_assert!(index < self.capacity);
        // SAFETY: index < capacity keeps the offset inside the mapping.
        unsafe {
            self.map
                .as_mut_ptr()
                .add(SLOTS_OFFSET + index * size_of::<Slot>()) as *mut Slot
        }
    }

    fn lock(&self) -> TableGuard<'_> {
        let me = getpid().as_raw();
        let lock = &self.header().lock;
        let mut attempts: u32 = 0;

        loop {
            let holder = match lock.compare_exchange_weak(0, me, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return TableGuard { table: self },
                Err(holder) => holder,
            };

            attempts = attempts.wrapping_add(1);
            if attempts < SPINS_BEFORE_YIELD {
                std::hint::spin_loop();
                continue;
            }
            thread::yield_now();

            if attempts % YIELDS_PER_LIVENESS_CHECK == 0
                && holder != 0
                && holder != me
                && holder_is_gone(holder)
                && lock
                    .compare_exchange(holder, me, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                warn!(holder, "reclaimed process table lock from exited process");
                return TableGuard { table: self };
            }
        }
    }
}

/// Zero-filled memory that forked children share with their parent
///
/// Anonymous memmap2 mappings are private (copy-on-write after fork); a
/// file mapping is `MAP_SHARED`, so the table is backed by a memfd.
fn shared_mapping(len: usize) -> io::Result<MmapRaw> {
    let name = CString::new("procyard-table")?;
    let file = File::from(memfd_create(&name, MemFdCreateFlag::MFD_CLOEXEC)?);
    file.set_len(len as u64)?;
    MmapOptions::new().len(len).map_raw(&file)
}

/// True once `pid` can no longer release the lock: it does not exist or is
/// a zombie waiting to be reaped
fn holder_is_gone(pid: i32) -> bool {
    let pid = Pid::from_raw(pid);
    if matches!(kill(pid, None), Err(Errno::ESRCH)) {
        return true;
    }

    // Our own child: peek at its state without reaping it
    let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT;
    match waitid(Id::Pid(pid), flags) {
        Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) => return true,
        Ok(_) => return false,
        Err(_) => {}
    }

    is_zombie(pid)
}

/// Process state from `/proc/<pid>/stat` (a sibling's exit status is only
/// visible to the parent)
fn is_zombie(pid: Pid) -> bool {
    let Ok(stat) = fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    // The command name may contain spaces and parentheses; the state
    // follows the last ')'
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.trim_start().chars().next())
        .is_some_and(|state| matches!(state, 'Z' | 'X'))
}

impl fmt::Debug for ProcessTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessTable")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

/// Exclusive access to the slots for as long as it lives
struct TableGuard<'a> {
    table: &'a ProcessTable,
}

impl TableGuard<'_> {
    fn read(&self, index: usize) -> Slot {
        // SAFETY: the lock is held, so no other process writes this slot.
        unsafe { ptr::read(self.table.slot_ptr(index)) }
    }

    fn write(&self, index: usize, slot: &Slot) {
        // SAFETY: the lock is held, so no other process reads or writes this slot.
        unsafe { ptr::write(self.table.slot_ptr(index), *slot) }
    }

    fn find(&self, pid: i32) -> Option<usize> {
        if pid <= 0 {
            return None;
        }
        (0..self.table.capacity).find(|&index| self.read(index).pid == pid)
    }

    fn find_free(&self) -> Option<usize> {
        (0..self.table.capacity).find(|&index| self.read(index).pid == 0)
    }
}

impl Drop for TableGuard<'_> {
    fn drop(&mut self) {
        self.table.header().lock.store(0, Ordering::Release);
    }
}
