//! Bus interface
//!
//! The block is driven by signals from the node's dispatcher and answers
//! with reply signals on the same bus. This module holds the typed payloads
//! of both directions plus the [`SignalBus`] trait the embedding scheduler
//! implements. Page buffers travel inside the signals: the caller loans
//! them in with the request and receives them back in the reply.

use bitflags::bitflags;

use crate::error::ErrorKind;
use crate::pages::Page;

/// Reference to a block instance on the signal bus. The upper half is the
/// block number, the lower half the node.
pub type BlockRef = u32;

/// Block number of a reference.
pub fn block_no(r: BlockRef) -> u32 {
    r >> 16
}

bitflags! {
    /// Open request flag word. The low two bits select the access mode and
    /// are decoded with [`OpenFlags::access_mode`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const WRITEONLY      = 0x1;
        const READWRITE      = 0x2;
        const APPEND         = 0x8;
        /// Sync every write, or fall back to periodic auto-sync when the
        /// platform flag is not enabled.
        const SYNC           = 0x10;
        const CREATE         = 0x100;
        const TRUNCATE       = 0x200;
        const CREATE_IF_NONE = 0x800;
        /// Zero-fill the file to its declared size while opening.
        const INIT           = 0x1000;
        /// Execute on the shared worker pool instead of binding a
        /// dedicated thread to the file.
        const THREAD_POOL    = 0x4000;
    }
}

/// Access mode carried in the low bits of [`OpenFlags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl OpenFlags {
    /// Decode the access mode; the remaining bit pattern (3) is invalid.
    pub fn access_mode(self) -> Option<AccessMode> {
        match self.bits() & 0x3 {
            0 => Some(AccessMode::ReadOnly),
            1 => Some(AccessMode::WriteOnly),
            2 => Some(AccessMode::ReadWrite),
            _ => None,
        }
    }
}

/// Open a file described by a logical file specification.
#[derive(Debug)]
pub struct FsOpenReq {
    pub user_ref: BlockRef,
    pub user_pointer: u32,
    pub file_number: [u32; 4],
    /// Caller-supplied name section, required for version 4 specs.
    pub name: Option<String>,
    pub file_flags: OpenFlags,
    pub page_size: u32,
    pub file_size: u64,
    pub auto_sync_size: u32,
    pub trace: u32,
}

/// Close an open file, optionally removing it.
#[derive(Debug)]
pub struct FsCloseReq {
    pub user_ref: BlockRef,
    pub user_pointer: u32,
    pub file_pointer: u16,
    pub remove: bool,
    pub trace: u32,
}

/// Page descriptors of a read or write request, in one of the three caller
/// formats. Offsets are byte offsets into the file.
#[derive(Debug)]
pub enum PageList {
    /// Independent pages, each with its own file offset.
    ListOfPairs(Vec<(Page, u64)>),
    /// One contiguous memory run covering consecutive file bytes.
    ArrayOfPages { buf: Page, offset: u64 },
    /// Several memory pages laid out consecutively in the file starting at
    /// `offset`; served with vectored I/O.
    ListOfMemPages { pages: Vec<Page>, offset: u64 },
}

impl PageList {
    /// Flatten into the bare page buffers, dropping the offsets. Used to
    /// hand loaned pages back on a refusal path.
    pub fn into_pages(self) -> Vec<Page> {
        match self {
            PageList::ListOfPairs(pairs) => pairs.into_iter().map(|(p, _)| p).collect(),
            PageList::ArrayOfPages { buf, .. } => vec![buf],
            PageList::ListOfMemPages { pages, .. } => pages,
        }
    }

    /// Total transfer size in bytes.
    pub fn total_len(&self) -> usize {
        match self {
            PageList::ListOfPairs(pairs) => pairs.iter().map(|(p, _)| p.len()).sum(),
            PageList::ArrayOfPages { buf, .. } => buf.len(),
            PageList::ListOfMemPages { pages, .. } => pages.iter().map(|p| p.len()).sum(),
        }
    }
}

/// Read pages from an open file.
#[derive(Debug)]
pub struct FsReadWriteReq {
    pub user_ref: BlockRef,
    pub user_pointer: u32,
    pub file_pointer: u16,
    pub pages: PageList,
    /// Write: sync after the write. Read: ignored.
    pub sync: bool,
    /// Read: a short transfer at end of file is reported as a success with
    /// the actual byte count. Write: ignored.
    pub partial: bool,
    pub trace: u32,
}

/// Sync an open file.
#[derive(Debug)]
pub struct FsSyncReq {
    pub user_ref: BlockRef,
    pub user_pointer: u32,
    pub file_pointer: u16,
    pub trace: u32,
}

/// Append bytes to an open file.
#[derive(Debug)]
pub struct FsAppendReq {
    pub user_ref: BlockRef,
    pub user_pointer: u32,
    pub file_pointer: u16,
    pub data: Vec<u8>,
    pub sync: bool,
    pub trace: u32,
}

/// Remove a file or recursively remove a directory.
#[derive(Debug)]
pub struct FsRemoveReq {
    pub user_ref: BlockRef,
    pub user_pointer: u32,
    pub file_number: [u32; 4],
    pub name: Option<String>,
    pub directory: bool,
    pub own_directory: bool,
    pub trace: u32,
}

/// Suspend the worker currently serving a file. Zero milliseconds makes a
/// pool worker exit instead. Never answered.
#[derive(Debug)]
pub struct FsSuspendOrd {
    pub file_pointer: u16,
    pub milliseconds: u32,
    pub trace: u32,
}

/// Pre-fault (and optionally lock) the managed memory, off the signal
/// thread.
#[derive(Debug)]
pub struct AllocMemReq {
    pub sender_ref: BlockRef,
    pub sender_data: u32,
    pub memlock: bool,
    pub trace: u32,
}

/// Callable executed by a worker with a scratch page buffer; carries a
/// CPU-heavy index build off the signal thread. Returns a caller error
/// code.
pub type IndexBuildFn = Box<dyn FnOnce(&mut [u8]) -> Result<(), u32> + Send>;

/// Run an index build on a worker thread.
pub struct BuildIndexReq {
    pub sender_ref: BlockRef,
    pub sender_data: u32,
    pub buffer_size: u32,
    pub func: IndexBuildFn,
    pub trace: u32,
}

impl std::fmt::Debug for BuildIndexReq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildIndexReq")
            .field("sender_ref", &self.sender_ref)
            .field("sender_data", &self.sender_data)
            .field("buffer_size", &self.buffer_size)
            .finish()
    }
}

/// Error payload of a refused request. `os_error` holds the untranslated
/// OS error number, or [`crate::error::LOCAL_ERROR`] when the block raised
/// the error itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsRef {
    pub user_pointer: u32,
    pub error: ErrorKind,
    pub os_error: u32,
}

/// Reply signals emitted by the block. Loaned page buffers ride back to
/// the caller on both the confirmation and the refusal path.
#[derive(Debug)]
pub enum Reply {
    OpenConf {
        user_pointer: u32,
        file_pointer: u16,
    },
    OpenRef(FsRef),
    CloseConf {
        user_pointer: u32,
    },
    CloseRef(FsRef),
    ReadConf {
        user_pointer: u32,
        /// Actual transfer size of a partial read.
        bytes_read: Option<u32>,
        pages: Vec<Page>,
    },
    ReadRef(FsRef, Vec<Page>),
    WriteConf {
        user_pointer: u32,
        pages: Vec<Page>,
    },
    WriteRef(FsRef, Vec<Page>),
    SyncConf {
        user_pointer: u32,
    },
    SyncRef(FsRef),
    AppendConf {
        user_pointer: u32,
        bytes: u32,
    },
    AppendRef(FsRef),
    RemoveConf {
        user_pointer: u32,
    },
    RemoveRef(FsRef),
    AllocMemConf {
        sender_data: u32,
        bytes: u64,
    },
    AllocMemRef {
        sender_data: u32,
        error: u32,
    },
    BuildIndexConf {
        sender_data: u32,
    },
    BuildIndexRef {
        sender_data: u32,
        error: u32,
    },
}

/// Self-signals driving the reply scan loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueB {
    /// Periodic scan tick, re-armed on every delivery.
    ScanMemoryChannel,
    /// Immediate continuation while the reply channel keeps yielding.
    ScanMemoryChannelNoDelay,
}

/// Outbound side of the signal bus, implemented by the embedding
/// scheduler. The block only ever calls this from its own thread.
pub trait SignalBus {
    /// Deliver a reply signal to `dest`.
    fn send(&mut self, dest: BlockRef, reply: Reply);

    /// Deliver a continuation back to this block after `delay_ms`
    /// milliseconds (zero means next dispatch round).
    fn send_continueb(&mut self, delay_ms: u32, sig: ContinueB);
}
