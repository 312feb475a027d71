//! Per-subsystem error types.
//!
//! Each subsystem owns a small error enum; [`KernelError`] aggregates them
//! with `From` conversions so call sites can use `?` across module
//! boundaries without losing which subsystem actually failed.

use core::fmt;

/// Physical memory manager errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmmError {
    OutOfMemory,
    DoubleFree { frame: u32 },
    InvalidFrame { frame: u32 },
}

/// Kernel heap errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    OutOfMemory { requested: usize },
    CorruptedBlock { addr: usize },
    InvalidFree { addr: usize },
}

/// Virtual memory manager errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmError {
    AlreadyMapped { va: u32 },
    NotMapped { va: u32 },
    OutOfMemory,
    InvalidTransientAddress { va: u32 },
}

/// Scheduler errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    TaskTableFull,
    TaskNotFound { pid: i32 },
    QueueInvariantViolated { detail: &'static str },
}

/// IPC errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    PortNotFound { port: i32 },
    PortAlreadyBound { port: i32 },
    NotReceiver { port: i32 },
    MessageTooLarge { size: usize, max: usize },
    ChecksumMismatch,
    WouldBlock,
}

/// ELF32 loader errors (§1B `EXEC`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    NotElf,
    WrongClass,
    WrongByteOrder,
    NotExecutable,
    WrongMachine,
    BadProgramHeaderSize,
    SegmentOutOfRange { vaddr: u32 },
    OutOfMemory,
    MappingFailed,
}

/// System call dispatch errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    InvalidNumber { nr: u32 },
    InvalidArgument { arg: usize },
    InvalidPointer { addr: usize },
    BufferTooSmall { required: usize, provided: usize },
}

/// Aggregated kernel error, convertible from each subsystem error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    Pmm(PmmError),
    Heap(HeapError),
    Vmm(VmmError),
    Sched(SchedError),
    Ipc(IpcError),
    Syscall(SyscallError),
    Elf(ElfError),
}

pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pmm(e) => write!(f, "pmm: {:?}", e),
            Self::Heap(e) => write!(f, "heap: {:?}", e),
            Self::Vmm(e) => write!(f, "vmm: {:?}", e),
            Self::Sched(e) => write!(f, "sched: {:?}", e),
            Self::Ipc(e) => write!(f, "ipc: {:?}", e),
            Self::Syscall(e) => write!(f, "syscall: {:?}", e),
            Self::Elf(e) => write!(f, "elf: {:?}", e),
        }
    }
}

impl From<PmmError> for KernelError {
    fn from(e: PmmError) -> Self {
        Self::Pmm(e)
    }
}

impl From<HeapError> for KernelError {
    fn from(e: HeapError) -> Self {
        Self::Heap(e)
    }
}

impl From<VmmError> for KernelError {
    fn from(e: VmmError) -> Self {
        Self::Vmm(e)
    }
}

impl From<SchedError> for KernelError {
    fn from(e: SchedError) -> Self {
        Self::Sched(e)
    }
}

impl From<IpcError> for KernelError {
    fn from(e: IpcError) -> Self {
        Self::Ipc(e)
    }
}

impl From<SyscallError> for KernelError {
    fn from(e: SyscallError) -> Self {
        Self::Syscall(e)
    }
}

impl From<ElfError> for KernelError {
    fn from(e: ElfError) -> Self {
        Self::Elf(e)
    }
}
