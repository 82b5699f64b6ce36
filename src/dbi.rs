use nix::sys::uio::{process_vm_readv, IoVec, RemoteIoVec};
use nix::unistd::getpid;
use simple_error::{bail, try_with};

use crate::result::Result;

/// Thread id as handed out by the host framework. Not an OS tid.
pub type Tid = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

/// Images the kernel maps without a backing file.
const VDSO_NAMES: &[&str] = &["[vdso]", "[linux-gate.so.1]", "[linux-vdso.so.1]"];

/// An executable image as described by the host framework at load time.
#[derive(Debug, Clone)]
pub struct Image {
    pub path: String,
    pub main_executable: bool,
    pub interpreter: bool,
}

impl Image {
    pub fn basename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn is_vdso(&self) -> bool {
        VDSO_NAMES.contains(&self.path.as_str()) || VDSO_NAMES.contains(&self.basename())
    }

    pub fn is_libc(&self) -> bool {
        self.basename().contains("libc")
    }
}

#[derive(Debug, Clone)]
pub struct Routine {
    pub address: u64,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub routines: Vec<Routine>,
}

/// Safe reads from the instrumented address space. Hook arguments can be
/// unmapped or hostile pointers, so raw dereferencing is not an option.
/// `read` returns how many leading bytes were actually readable.
pub trait TargetMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<usize>;
}

/// Reads the instrumenting process itself, which is where a DBI tool and
/// its target live. Going through the kernel turns a would-be fault into
/// a short read.
pub struct OwnMemory;

impl TargetMemory for OwnMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        let len = buf.len();
        let local = [IoVec::from_mut_slice(buf)];
        let remote = [RemoteIoVec {
            base: addr as usize,
            len,
        }];
        Ok(try_with!(
            process_vm_readv(getpid(), &local, &remote),
            "cannot read {} bytes at {:#x}",
            len,
            addr
        ))
    }
}

pub fn read_pointer(mem: &dyn TargetMemory, addr: u64) -> Result<u64> {
    let mut buf = [0u8; 8];
    let n = try_with!(mem.read(addr, &mut buf), "cannot read pointer at {:#x}", addr);
    if n != buf.len() {
        bail!("short read at {:#x}: {} of {} bytes", addr, n, buf.len());
    }
    Ok(u64::from_ne_bytes(buf))
}

/// Reads a NUL-terminated string of at most `max` bytes. A string that
/// runs into unreadable memory is cut at the last readable byte.
pub fn read_cstring(mem: &dyn TargetMemory, addr: u64, max: usize) -> Result<String> {
    let mut buf = vec![0u8; max];
    let n = try_with!(mem.read(addr, &mut buf), "cannot read string at {:#x}", addr);
    let end = buf[..n].iter().position(|b| *b == 0).unwrap_or(n);
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}
