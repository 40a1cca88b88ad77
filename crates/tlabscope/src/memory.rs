//! Fault-tolerant raw memory reads.
//!
//! Class metadata of the monitored runtime is read through a [`MemoryReader`] instead of
//! dereferencing pointers, so a stale or garbage class handle produces a [`ReadFault`]
//! rather than a segfault inside the instrumented process.

use std::sync::OnceLock;

use crate::error::ReadFault;

/// Source of raw bytes addressed by virtual address.
pub trait MemoryReader: Send + Sync {
    /// Copies bytes starting at `addr` into `buf` and returns how many were copied.
    ///
    /// A short count means the range ran into inaccessible memory; bytes past the count are
    /// left untouched. An error means nothing could be read.
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<usize, ReadFault>;

    fn read_u64(&self, addr: u64) -> Result<u64, ReadFault> {
        let mut raw = [0u8; 8];
        match self.read(addr, &mut raw)? {
            8 => Ok(u64::from_ne_bytes(raw)),
            _ => Err(ReadFault { addr }),
        }
    }
}

impl<M: MemoryReader + ?Sized> MemoryReader for &M {
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<usize, ReadFault> {
        (**self).read(addr, buf)
    }
}

static PAGE_SIZE: OnceLock<u64> = OnceLock::new();

fn page_size() -> u64 {
    *PAGE_SIZE.get_or_init(|| {
        let v = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if v <= 0 {
            4096
        } else {
            v as u64
        }
    })
}

/// Reads the address space of a live process, by default the current one.
///
/// On Linux this goes through `process_vm_readv(2)`, which reports `EFAULT` for unmapped
/// ranges instead of raising `SIGSEGV`. The remote range is split at the first page
/// boundary so that a buffer straddling into an unmapped page still yields its readable
/// prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessMemory {
    pid: u32,
}

impl ProcessMemory {
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
        }
    }

    pub fn of(pid: u32) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Default for ProcessMemory {
    fn default() -> Self {
        Self::current()
    }
}

impl MemoryReader for ProcessMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<usize, ReadFault> {
        if buf.is_empty() {
            return Ok(0);
        }
        if addr == 0 || addr.checked_add(buf.len() as u64).is_none() {
            return Err(ReadFault { addr });
        }

        cfg_if::cfg_if! {
            if #[cfg(target_os = "linux")] {
                read_process_vm(self.pid, addr, buf)
            } else {
                Err(ReadFault { addr })
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn read_process_vm(pid: u32, addr: u64, buf: &mut [u8]) -> Result<usize, ReadFault> {
    let len = buf.len() as u64;
    let page = page_size();
    // `None` only for the last page of the address space, which then holds the whole range.
    let page_end = (addr & !(page - 1)).checked_add(page);
    let head = page_end.map_or(len, |end| len.min(end - addr));

    let local = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let remote = [
        libc::iovec {
            iov_base: addr as *mut libc::c_void,
            iov_len: head as usize,
        },
        libc::iovec {
            iov_base: page_end.unwrap_or(0) as *mut libc::c_void,
            iov_len: (len - head) as usize,
        },
    ];
    let remote_count = if head == len { 1 } else { 2 };

    // SAFETY: `local` covers exactly `buf`; the kernel validates the remote ranges.
    let copied = unsafe {
        libc::process_vm_readv(
            pid as libc::pid_t,
            &local,
            1,
            remote.as_ptr(),
            remote_count,
            0,
        )
    };

    if copied <= 0 {
        Err(ReadFault { addr })
    } else {
        Ok(copied as usize)
    }
}

/// An in-memory address space made of disjoint mapped regions.
///
/// Used to lay out synthetic runtime objects at chosen addresses and resolve them without
/// touching real process memory. Reads outside every region fault; reads running past the
/// end of a region are cut short, like reads into an unmapped page.
#[derive(Debug, Clone, Default)]
pub struct SyntheticMemory {
    regions: Vec<(u64, Vec<u8>)>,
}

impl SyntheticMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `len` zeroed bytes at `base`.
    pub fn map(mut self, base: u64, len: usize) -> Self {
        self.regions.push((base, vec![0; len]));
        self
    }

    pub fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<(), ReadFault> {
        let (base, region) = self
            .regions
            .iter_mut()
            .find(|(base, region)| addr >= *base && addr < *base + region.len() as u64)
            .ok_or(ReadFault { addr })?;
        let start = (addr - *base) as usize;
        let end = start + bytes.len();
        if end > region.len() {
            return Err(ReadFault {
                addr: *base + region.len() as u64,
            });
        }
        region[start..end].copy_from_slice(bytes);
        Ok(())
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) -> Result<(), ReadFault> {
        self.write(addr, &value.to_ne_bytes())
    }
}

impl MemoryReader for SyntheticMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<usize, ReadFault> {
        let (base, region) = self
            .regions
            .iter()
            .find(|(base, region)| addr >= *base && addr < *base + region.len() as u64)
            .ok_or(ReadFault { addr })?;
        let start = (addr - *base) as usize;
        let n = buf.len().min(region.len() - start);
        buf[..n].copy_from_slice(&region[start..start + n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_reads_are_cut_at_region_end() {
        let mut memory = SyntheticMemory::new().map(0x1000, 16);
        memory.write(0x100c, b"abcd").unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(memory.read(0x100c, &mut buf), Ok(4));
        assert_eq!(&buf, b"abcd\0\0\0\0");

        assert_eq!(memory.read(0x2000, &mut buf), Err(ReadFault { addr: 0x2000 }));
        assert!(memory.write(0x100e, b"abcd").is_err());
    }

    #[test]
    fn synthetic_read_u64_requires_full_width() {
        let mut memory = SyntheticMemory::new().map(0x1000, 12);
        memory.write_u64(0x1000, 0xdead_beef).unwrap();
        assert_eq!(memory.read_u64(0x1000), Ok(0xdead_beef));
        assert_eq!(memory.read_u64(0x1008), Err(ReadFault { addr: 0x1008 }));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn process_memory_reads_own_address_space() {
        let data: [u8; 5] = *b"hello";
        let mut buf = [0u8; 5];
        let n = ProcessMemory::current()
            .read(data.as_ptr() as u64, &mut buf)
            .unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn process_memory_faults_on_null_and_unmapped() {
        let memory = ProcessMemory::current();
        let mut buf = [0u8; 8];
        assert!(memory.read(0, &mut buf).is_err());
        assert!(memory.read(16, &mut buf).is_err());
        assert_eq!(buf, [0u8; 8]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn process_memory_tolerates_top_of_address_space() {
        let memory = ProcessMemory::current();
        let mut buf = [0u8; 8];
        assert!(memory.read(u64::MAX - 100, &mut buf).is_err());
        assert!(memory.read(u64::MAX - 7, &mut buf).is_err());
        assert!(memory.read(u64::MAX - 3, &mut buf).is_err());
        assert!(memory.read_u64(u64::MAX - 0x40 + 16).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn process_memory_reads_by_pid() {
        let memory = ProcessMemory::of(std::process::id());
        assert_eq!(memory.pid(), ProcessMemory::current().pid());

        let value: u64 = 0x1234_5678_9abc_def0;
        assert_eq!(memory.read_u64(&value as *const u64 as u64), Ok(value));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn process_memory_returns_prefix_before_unmapped_page() {
        let page = page_size() as usize;
        // SAFETY: anonymous private mapping of two pages, second one unmapped right away.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                page * 2,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(base, libc::MAP_FAILED);
        let base = base as *mut u8;
        unsafe {
            assert_eq!(libc::munmap(base.add(page) as *mut libc::c_void, page), 0);
            std::ptr::copy_nonoverlapping(b"java/lang".as_ptr(), base.add(page - 9), 9);
        }

        let mut buf = [0u8; 16];
        let n = ProcessMemory::current()
            .read(base as u64 + page as u64 - 9, &mut buf)
            .unwrap();
        assert_eq!(n, 9);
        assert_eq!(&buf[..9], b"java/lang");
        assert_eq!(&buf[9..], &[0u8; 7]);

        unsafe {
            libc::munmap(base as *mut libc::c_void, page);
        }
    }
}
