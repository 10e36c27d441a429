//! Proxy system-call layer: guest `ecall`s serviced against the host OS.
//!
//! Arguments arrive in a0–a5, the number in a7; the result (or a negated
//! errno) is returned in a0, per the Linux convention the guest libc
//! expects. Unknown numbers return -ENOSYS so a guest libc can fall back.

use memory::{Prot, PAGE_MASK};
use rvsim_cpu_core::{CpuState, Trap, Xlen};

use crate::bus::MmuBus;

// RISC-V Linux syscall numbers (asm-generic).
const SYS_IOCTL: u64 = 29;
const SYS_OPENAT: u64 = 56;
const SYS_CLOSE: u64 = 57;
const SYS_LSEEK: u64 = 62;
const SYS_READ: u64 = 63;
const SYS_WRITE: u64 = 64;
const SYS_WRITEV: u64 = 66;
const SYS_READLINKAT: u64 = 78;
const SYS_FSTAT: u64 = 80;
const SYS_EXIT: u64 = 93;
const SYS_EXIT_GROUP: u64 = 94;
const SYS_SET_TID_ADDRESS: u64 = 96;
const SYS_CLOCK_GETTIME: u64 = 113;
const SYS_UNAME: u64 = 160;
const SYS_GETTIMEOFDAY: u64 = 169;
const SYS_GETPID: u64 = 172;
const SYS_GETUID: u64 = 174;
const SYS_GETEUID: u64 = 175;
const SYS_GETGID: u64 = 176;
const SYS_GETEGID: u64 = 177;
const SYS_BRK: u64 = 214;
const SYS_MUNMAP: u64 = 215;
const SYS_MMAP: u64 = 222;
const SYS_MPROTECT: u64 = 226;
const SYS_GETRANDOM: u64 = 278;

const MAP_ANONYMOUS: u64 = 0x20;
const AT_FDCWD_GUEST: i64 = -100;

/// What the run loop should do after a serviced ecall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysOutcome {
    Continue,
    Exit(i32),
}

/// Per-process proxy state.
pub struct SyscallProxy {
    brk_base: u64,
    brk: u64,
    mmap_next: u64,
    /// When set, guest writes to fds 1/2 are collected here instead of being
    /// forwarded to the host, so an embedding test can assert on them.
    capture: Option<Vec<u8>>,
}

impl SyscallProxy {
    pub fn new(brk_base: u64) -> Self {
        // Anonymous mappings are handed out well above the static image.
        let mmap_base = (brk_base + 0x1000_0000) & !PAGE_MASK;
        Self {
            brk_base,
            brk: brk_base,
            mmap_next: mmap_base,
            capture: None,
        }
    }

    pub fn capture_output(&mut self) {
        self.capture = Some(Vec::new());
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        self.capture.as_mut().map(std::mem::take).unwrap_or_default()
    }

    /// Service the ecall pending in `cpu`. Memory faults during argument
    /// marshalling surface as EFAULT rather than guest traps.
    pub fn handle(&mut self, cpu: &mut CpuState, bus: &mut MmuBus) -> SysOutcome {
        let num = cpu.x(17);
        let a: [u64; 6] = [cpu.x(10), cpu.x(11), cpu.x(12), cpu.x(13), cpu.x(14), cpu.x(15)];

        if matches!(num, SYS_EXIT | SYS_EXIT_GROUP) {
            return SysOutcome::Exit(a[0] as i32);
        }

        let result = self.dispatch(num, a, cpu, bus);
        let ret = match result {
            Ok(v) => v,
            Err(errno) => -(errno as i64) as u64,
        };
        tracing::trace!(num, ret = format_args!("0x{ret:x}"), "syscall");
        cpu.set_x(10, ret);
        SysOutcome::Continue
    }

    fn dispatch(
        &mut self,
        num: u64,
        a: [u64; 6],
        cpu: &mut CpuState,
        bus: &mut MmuBus,
    ) -> Result<u64, i32> {
        match num {
            SYS_READ => self.sys_read(bus, a[0] as i32, a[1], a[2]),
            SYS_WRITE => self.sys_write(bus, a[0] as i32, a[1], a[2]),
            SYS_WRITEV => self.sys_writev(cpu, bus, a[0] as i32, a[1], a[2]),
            SYS_OPENAT => self.sys_openat(bus, a[0] as i64, a[1], a[2], a[3]),
            SYS_CLOSE => {
                if a[0] <= 2 {
                    // Leave the simulator's own stdio alone.
                    return Ok(0);
                }
                host_result(unsafe { libc::close(a[0] as i32) } as i64)
            }
            SYS_LSEEK => {
                host_result(unsafe { libc::lseek(a[0] as i32, a[1] as i64, a[2] as i32) })
            }
            SYS_FSTAT => self.sys_fstat(bus, a[0] as i32, a[1]),
            SYS_READLINKAT => self.sys_readlinkat(bus, a[0] as i64, a[1], a[2], a[3]),
            SYS_IOCTL => Err(libc::ENOTTY),
            SYS_SET_TID_ADDRESS => Ok(std::process::id() as u64),
            SYS_UNAME => self.sys_uname(cpu, bus, a[0]),
            SYS_GETTIMEOFDAY => self.sys_gettimeofday(cpu, bus, a[0]),
            SYS_CLOCK_GETTIME => self.sys_clock_gettime(cpu, bus, a[1]),
            SYS_GETPID => Ok(std::process::id() as u64),
            SYS_GETUID => Ok(unsafe { libc::getuid() } as u64),
            SYS_GETEUID => Ok(unsafe { libc::geteuid() } as u64),
            SYS_GETGID => Ok(unsafe { libc::getgid() } as u64),
            SYS_GETEGID => Ok(unsafe { libc::getegid() } as u64),
            SYS_BRK => self.sys_brk(bus, a[0]),
            SYS_MMAP => self.sys_mmap(bus, a[0], a[1], a[2], a[3], a[4] as i64),
            SYS_MUNMAP => self.sys_munmap(bus, a[0], a[1]),
            SYS_MPROTECT => self.sys_mprotect(bus, a[0], a[1], a[2]),
            SYS_GETRANDOM => self.sys_getrandom(bus, a[0], a[1]),
            _ => {
                tracing::debug!(num, "unimplemented syscall");
                Err(libc::ENOSYS)
            }
        }
    }

    fn sys_read(&mut self, bus: &mut MmuBus, fd: i32, buf: u64, len: u64) -> Result<u64, i32> {
        let len = len.min(1 << 20) as usize;
        let mut tmp = vec![0u8; len];
        let n = unsafe { libc::read(fd, tmp.as_mut_ptr().cast(), len) };
        if n < 0 {
            return Err(errno());
        }
        bus.write_guest_bytes(buf, &tmp[..n as usize])
            .map_err(fault_errno)?;
        Ok(n as u64)
    }

    fn sys_write(&mut self, bus: &mut MmuBus, fd: i32, buf: u64, len: u64) -> Result<u64, i32> {
        let len = len.min(1 << 20) as usize;
        let data = bus.read_guest_bytes(buf, len).map_err(fault_errno)?;
        if (fd == 1 || fd == 2) && self.capture.is_some() {
            self.capture.as_mut().unwrap().extend_from_slice(&data);
            return Ok(data.len() as u64);
        }
        let n = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
        host_result(n as i64)
    }

    fn sys_writev(
        &mut self,
        cpu: &CpuState,
        bus: &mut MmuBus,
        fd: i32,
        iov: u64,
        iovcnt: u64,
    ) -> Result<u64, i32> {
        let word = word_size(cpu);
        let mut total = 0u64;
        for i in 0..iovcnt.min(64) {
            let entry = iov + i * 2 * word;
            let base = read_word(cpu, bus, entry).map_err(fault_errno)?;
            let len = read_word(cpu, bus, entry + word).map_err(fault_errno)?;
            if len == 0 {
                continue;
            }
            let n = self.sys_write(bus, fd, base, len)?;
            total += n;
            if n < len {
                break;
            }
        }
        Ok(total)
    }

    fn sys_openat(
        &mut self,
        bus: &mut MmuBus,
        dirfd: i64,
        path: u64,
        flags: u64,
        mode: u64,
    ) -> Result<u64, i32> {
        let path = bus.read_guest_cstr(path, 4096).map_err(fault_errno)?;
        let cpath = std::ffi::CString::new(path).map_err(|_| libc::EINVAL)?;
        let dirfd = if dirfd == AT_FDCWD_GUEST {
            libc::AT_FDCWD
        } else {
            dirfd as i32
        };
        let fd = unsafe {
            libc::openat(dirfd, cpath.as_ptr(), flags as i32, mode as libc::c_uint)
        };
        host_result(fd as i64)
    }

    fn sys_readlinkat(
        &mut self,
        bus: &mut MmuBus,
        dirfd: i64,
        path: u64,
        buf: u64,
        len: u64,
    ) -> Result<u64, i32> {
        let path = bus.read_guest_cstr(path, 4096).map_err(fault_errno)?;
        let cpath = std::ffi::CString::new(path).map_err(|_| libc::EINVAL)?;
        let dirfd = if dirfd == AT_FDCWD_GUEST {
            libc::AT_FDCWD
        } else {
            dirfd as i32
        };
        let len = len.min(4096) as usize;
        let mut tmp = vec![0u8; len];
        let n = unsafe { libc::readlinkat(dirfd, cpath.as_ptr(), tmp.as_mut_ptr().cast(), len) };
        if n < 0 {
            return Err(errno());
        }
        bus.write_guest_bytes(buf, &tmp[..n as usize])
            .map_err(fault_errno)?;
        Ok(n as u64)
    }

    fn sys_fstat(&mut self, bus: &mut MmuBus, fd: i32, statbuf: u64) -> Result<u64, i32> {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut st) } < 0 {
            return Err(errno());
        }
        let image = encode_stat(&st);
        bus.write_guest_bytes(statbuf, &image).map_err(fault_errno)?;
        Ok(0)
    }

    fn sys_uname(&mut self, cpu: &CpuState, bus: &mut MmuBus, buf: u64) -> Result<u64, i32> {
        let machine = match cpu.xlen {
            Xlen::Rv32 => "riscv32",
            Xlen::Rv64 => "riscv64",
        };
        let mut image = Vec::with_capacity(6 * 65);
        for field in ["Linux", "rvsim", "4.15.0", "#1 SMP", machine, ""] {
            let mut bytes = [0u8; 65];
            let src = field.as_bytes();
            bytes[..src.len()].copy_from_slice(src);
            image.extend_from_slice(&bytes);
        }
        bus.write_guest_bytes(buf, &image).map_err(fault_errno)?;
        Ok(0)
    }

    fn sys_gettimeofday(&mut self, cpu: &CpuState, bus: &mut MmuBus, tv: u64) -> Result<u64, i32> {
        if tv == 0 {
            return Ok(0);
        }
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|_| libc::EINVAL)?;
        let word = word_size(cpu);
        write_word(cpu, bus, tv, now.as_secs()).map_err(fault_errno)?;
        write_word(cpu, bus, tv + word, now.subsec_micros() as u64).map_err(fault_errno)?;
        Ok(0)
    }

    fn sys_clock_gettime(&mut self, cpu: &CpuState, bus: &mut MmuBus, tp: u64) -> Result<u64, i32> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|_| libc::EINVAL)?;
        let word = word_size(cpu);
        write_word(cpu, bus, tp, now.as_secs()).map_err(fault_errno)?;
        write_word(cpu, bus, tp + word, now.subsec_nanos() as u64).map_err(fault_errno)?;
        Ok(0)
    }

    fn sys_brk(&mut self, bus: &mut MmuBus, addr: u64) -> Result<u64, i32> {
        if addr == 0 || addr < self.brk_base {
            return Ok(self.brk);
        }
        if addr > self.brk {
            let old_end = (self.brk + PAGE_MASK) & !PAGE_MASK;
            let new_end = (addr + PAGE_MASK) & !PAGE_MASK;
            if new_end > old_end {
                bus.mmu_mut()
                    .mem_mut()
                    .map(old_end, new_end - old_end, Prot::RW)
                    .map_err(|_| libc::ENOMEM)?;
            }
        }
        // Shrinking keeps the pages mapped; the break just moves back.
        self.brk = addr;
        Ok(addr)
    }

    fn sys_mmap(
        &mut self,
        bus: &mut MmuBus,
        addr: u64,
        len: u64,
        prot: u64,
        flags: u64,
        fd: i64,
    ) -> Result<u64, i32> {
        if flags & MAP_ANONYMOUS == 0 || fd != -1 {
            return Err(libc::ENOSYS);
        }
        if len == 0 {
            return Err(libc::EINVAL);
        }
        let len = (len + PAGE_MASK) & !PAGE_MASK;
        let p = prot_flags(prot);

        if addr != 0 && addr & PAGE_MASK == 0 {
            if bus.mmu_mut().mem_mut().map(addr, len, p).is_ok() {
                return Ok(addr);
            }
        }
        let base = self.mmap_next;
        bus.mmu_mut()
            .mem_mut()
            .map(base, len, p)
            .map_err(|_| libc::ENOMEM)?;
        self.mmap_next = base + len;
        Ok(base)
    }

    fn sys_munmap(&mut self, bus: &mut MmuBus, addr: u64, len: u64) -> Result<u64, i32> {
        let len = (len + PAGE_MASK) & !PAGE_MASK;
        // Only whole previously-mapped segments can be released; anything
        // else is quietly accepted like an already-unmapped range.
        let _ = bus.mmu_mut().mem_mut().unmap(addr, len);
        Ok(0)
    }

    fn sys_mprotect(
        &mut self,
        bus: &mut MmuBus,
        addr: u64,
        len: u64,
        prot: u64,
    ) -> Result<u64, i32> {
        if len == 0 {
            return Ok(0);
        }
        let len = (len + PAGE_MASK) & !PAGE_MASK;
        bus.mmu_mut()
            .mem_mut()
            .protect(addr, len, prot_flags(prot))
            .map_err(|_| libc::EINVAL)?;
        Ok(0)
    }

    fn sys_getrandom(&mut self, bus: &mut MmuBus, buf: u64, len: u64) -> Result<u64, i32> {
        use rand::RngCore;
        let len = len.min(256) as usize;
        let mut tmp = vec![0u8; len];
        rand::rngs::OsRng.fill_bytes(&mut tmp);
        bus.write_guest_bytes(buf, &tmp).map_err(fault_errno)?;
        Ok(len as u64)
    }
}

/// Map PROT_READ/WRITE/EXEC bits onto segment protection.
fn prot_flags(prot: u64) -> Prot {
    let mut p = Prot::NONE;
    if prot & 1 != 0 {
        p = p.union(Prot::R);
    }
    if prot & 2 != 0 {
        p = p.union(Prot::W);
    }
    if prot & 4 != 0 {
        p = p.union(Prot::X);
    }
    p
}

#[inline]
fn word_size(cpu: &CpuState) -> u64 {
    match cpu.xlen {
        Xlen::Rv32 => 4,
        Xlen::Rv64 => 8,
    }
}

fn read_word(cpu: &CpuState, bus: &mut MmuBus, vaddr: u64) -> Result<u64, Trap> {
    use rvsim_cpu_core::CpuBus;
    match cpu.xlen {
        Xlen::Rv32 => Ok(bus.read_u32(vaddr)? as u64),
        Xlen::Rv64 => bus.read_u64(vaddr),
    }
}

fn write_word(cpu: &CpuState, bus: &mut MmuBus, vaddr: u64, value: u64) -> Result<(), Trap> {
    use rvsim_cpu_core::CpuBus;
    match cpu.xlen {
        Xlen::Rv32 => bus.write_u32(vaddr, value as u32),
        Xlen::Rv64 => bus.write_u64(vaddr, value),
    }
}

#[inline]
fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

#[inline]
fn fault_errno(_: Trap) -> i32 {
    libc::EFAULT
}

fn host_result(v: i64) -> Result<u64, i32> {
    if v < 0 {
        Err(errno())
    } else {
        Ok(v as u64)
    }
}

/// Serialise a host `stat` into the RISC-V Linux layout (asm-generic, 64-bit
/// fields; the guest libc only inspects a handful of them).
fn encode_stat(st: &libc::stat) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    let push32 = |out: &mut Vec<u8>, v: u32| out.extend_from_slice(&v.to_le_bytes());
    let push64 = |out: &mut Vec<u8>, v: u64| out.extend_from_slice(&v.to_le_bytes());

    push64(&mut out, st.st_dev as u64);
    push64(&mut out, st.st_ino as u64);
    push32(&mut out, st.st_mode);
    push32(&mut out, st.st_nlink as u32);
    push32(&mut out, st.st_uid);
    push32(&mut out, st.st_gid);
    push64(&mut out, st.st_rdev as u64);
    push64(&mut out, 0); // __pad1
    push64(&mut out, st.st_size as u64);
    push32(&mut out, st.st_blksize as u32);
    push32(&mut out, 0); // __pad2
    push64(&mut out, st.st_blocks as u64);
    push64(&mut out, st.st_atime as u64);
    push64(&mut out, st.st_atime_nsec as u64);
    push64(&mut out, st.st_mtime as u64);
    push64(&mut out, st.st_mtime_nsec as u64);
    push64(&mut out, st.st_ctime as u64);
    push64(&mut out, st.st_ctime_nsec as u64);
    push32(&mut out, 0); // __unused[0]
    push32(&mut out, 0); // __unused[1]
    out
}
