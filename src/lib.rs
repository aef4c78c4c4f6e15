//! Asynchronous file system block
//!
//! The file I/O subsystem of a distributed in-memory database's storage
//! node. Latency-variable file operations (open, read, write, sync,
//! append, directory removal, large allocations, index builds) are taken
//! off the latency-sensitive signal thread and executed on dedicated OS
//! worker threads, one per open file by default or on a small shared pool.
//!
//! The block itself never blocks: requests are decoded into pooled
//! records, handed to workers over memory channels, and completions are
//! polled back on a shared reply channel from a periodic continuation
//! signal. Logical files are addressed by a versioned file specification
//! that the [`Filename`] state machine maps onto the configured on-disk
//! roots.

#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub use crate::block::{Afs, AfsConfig, DumpOrd};
pub use crate::channel::MemoryChannel;
pub use crate::error::{translate_errno, ErrorKind, RequestError, LOCAL_ERROR};
pub use crate::filename::{
    parse_components, BasePathSpec, BasePaths, FileSpec, Filename, FilenameError, ParsedName,
    Suffix, NO_COUNT, NO_VAL_32, NO_VAL_8, PATH_MAX,
};
pub use crate::pages::{HeapPool, Page, PagePool, PAGE_SIZE};
pub use crate::signal::{
    block_no, AccessMode, AllocMemReq, BlockRef, BuildIndexReq, ContinueB, FsAppendReq,
    FsCloseReq, FsOpenReq, FsReadWriteReq, FsRef, FsRemoveReq, FsSuspendOrd, FsSyncReq,
    IndexBuildFn, OpenFlags, PageList, Reply, SignalBus,
};
pub use crate::void::VoidAfs;

mod block;
mod channel;
mod error;
mod file;
mod filename;
mod open_files;
mod pages;
mod pool;
mod request;
mod signal;
mod sys;
mod void;
mod worker;
