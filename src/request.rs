//! Request records
//!
//! The unit of work handed from the block to a worker and back. A request
//! is owned by the pool, loaned to exactly one thread at a time through a
//! memory channel, and carries everything the worker needs: the action,
//! its parameters, the originating correlation fields and the error slot
//! the worker fills in.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::error::RequestError;
use crate::file::AsyncFile;
use crate::pages::Page;
use crate::signal::{BlockRef, IndexBuildFn, OpenFlags};

/// One page of an I/O request: an owned buffer plus its byte offset in the
/// file. The transfer size is the buffer length.
#[derive(Debug)]
pub(crate) struct IoPage {
    pub buf: Page,
    pub offset: u64,
}

/// Maximum pages per read or write request.
pub(crate) const MAX_PAGES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    Open,
    Close,
    CloseRemove,
    Read,
    ReadPartial,
    Readv,
    Write,
    Writev,
    WriteSync,
    WritevSync,
    Sync,
    Append,
    AppendSync,
    Rmrf,
    AllocMem,
    BuildIndex,
    Suspend,
    End,
}

impl Action {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Action::Open => "open",
            Action::Close => "close",
            Action::CloseRemove => "closeRemove",
            Action::Read => "read",
            Action::ReadPartial => "readPartial",
            Action::Readv => "readv",
            Action::Write => "write",
            Action::Writev => "writev",
            Action::WriteSync => "writeSync",
            Action::WritevSync => "writevSync",
            Action::Sync => "sync",
            Action::Append => "append",
            Action::AppendSync => "appendSync",
            Action::Rmrf => "rmrf",
            Action::AllocMem => "allocMem",
            Action::BuildIndex => "buildIndex",
            Action::Suspend => "suspend",
            Action::End => "end",
        }
    }
}

/// Per-action parameters. Page buffers and payloads live here while the
/// request is in flight and are moved back out when the reply is built.
pub(crate) enum Params {
    None,
    Open {
        flags: OpenFlags,
        file_size: u64,
        auto_sync_size: u32,
    },
    ReadWrite {
        pages: SmallVec<[IoPage; 8]>,
        /// Total bytes actually transferred; only meaningful for partial
        /// reads.
        bytes_read: u64,
    },
    Append {
        data: Vec<u8>,
    },
    Rmrf {
        directory: bool,
        own_directory: bool,
    },
    Alloc {
        memlock: bool,
        bytes: u64,
    },
    BuildIndex {
        func: Option<IndexBuildFn>,
        buffer_size: u32,
    },
    Suspend {
        milliseconds: u32,
    },
}

impl std::fmt::Debug for Params {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Params::None => f.write_str("None"),
            Params::Open { flags, .. } => write!(f, "Open({flags:?})"),
            Params::ReadWrite { pages, .. } => write!(f, "ReadWrite({} pages)", pages.len()),
            Params::Append { data } => write!(f, "Append({} bytes)", data.len()),
            Params::Rmrf { directory, .. } => write!(f, "Rmrf(directory={directory})"),
            Params::Alloc { memlock, .. } => write!(f, "Alloc(memlock={memlock})"),
            Params::BuildIndex { buffer_size, .. } => {
                write!(f, "BuildIndex({buffer_size} bytes)")
            }
            Params::Suspend { milliseconds } => write!(f, "Suspend({milliseconds} ms)"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Request {
    pub action: Action,
    pub params: Params,
    /// Written by the worker; `None` on success.
    pub error: Option<RequestError>,
    pub user_ref: BlockRef,
    pub user_pointer: u32,
    pub file_pointer: u16,
    pub trace: u32,
    pub file: Option<Arc<AsyncFile>>,
}

impl Request {
    pub(crate) fn set(&mut self, user_ref: BlockRef, user_pointer: u32, file_pointer: u16) {
        self.user_ref = user_ref;
        self.user_pointer = user_pointer;
        self.file_pointer = file_pointer;
    }

    /// Move the page vector out for the reply.
    pub(crate) fn take_pages(&mut self) -> Vec<Page> {
        match std::mem::replace(&mut self.params, Params::None) {
            Params::ReadWrite { pages, .. } => pages.into_iter().map(|p| p.buf).collect(),
            _ => Vec::new(),
        }
    }
}

impl Default for Request {
    fn default() -> Request {
        Request {
            action: Action::End,
            params: Params::None,
            error: None,
            user_ref: 0,
            user_pointer: 0,
            file_pointer: 0,
            trace: 0,
            file: None,
        }
    }
}
