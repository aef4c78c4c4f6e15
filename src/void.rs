//! Null block for diskless nodes
//!
//! Speaks the same signal surface as the real block but acknowledges
//! every request without touching storage. Handles are issued and checked
//! so callers still see sane open/close semantics; reads come back
//! zero-filled.

use log::debug;

use crate::error::{ErrorKind, LOCAL_ERROR};
use crate::signal::{
    AllocMemReq, BuildIndexReq, FsAppendReq, FsCloseReq, FsOpenReq, FsReadWriteReq, FsRef,
    FsRemoveReq, FsSuspendOrd, FsSyncReq, Reply, SignalBus,
};

/// The diskless stand-in for [`crate::Afs`].
#[derive(Debug, Default)]
pub struct VoidAfs {
    last_id: u16,
    open: Vec<u16>,
}

impl VoidAfs {
    pub fn new() -> VoidAfs {
        VoidAfs::default()
    }

    pub fn open_file_count(&self) -> usize {
        self.open.len()
    }

    fn new_id(&mut self) -> u16 {
        loop {
            self.last_id = if self.last_id == u16::MAX {
                1
            } else {
                self.last_id + 1
            };
            if !self.open.contains(&self.last_id) {
                return self.last_id;
            }
        }
    }

    fn missing(user_pointer: u32) -> FsRef {
        FsRef {
            user_pointer,
            error: ErrorKind::FileDoesNotExist,
            os_error: LOCAL_ERROR,
        }
    }

    pub fn handle_open(&mut self, req: FsOpenReq, bus: &mut dyn SignalBus) {
        let id = self.new_id();
        self.open.push(id);
        debug!("void open -> {id}");
        bus.send(
            req.user_ref,
            Reply::OpenConf {
                user_pointer: req.user_pointer,
                file_pointer: id,
            },
        );
    }

    pub fn handle_close(&mut self, req: FsCloseReq, bus: &mut dyn SignalBus) {
        match self.open.iter().position(|id| *id == req.file_pointer) {
            Some(pos) => {
                self.open.remove(pos);
                bus.send(
                    req.user_ref,
                    Reply::CloseConf {
                        user_pointer: req.user_pointer,
                    },
                );
            }
            None => bus.send(
                req.user_ref,
                Reply::CloseRef(Self::missing(req.user_pointer)),
            ),
        }
    }

    pub fn handle_read(&mut self, req: FsReadWriteReq, bus: &mut dyn SignalBus) {
        let total = req.pages.total_len() as u32;
        let pages = req.pages.into_pages();
        if !self.open.contains(&req.file_pointer) {
            bus.send(
                req.user_ref,
                Reply::ReadRef(Self::missing(req.user_pointer), pages),
            );
            return;
        }
        bus.send(
            req.user_ref,
            Reply::ReadConf {
                user_pointer: req.user_pointer,
                bytes_read: req.partial.then_some(total),
                pages,
            },
        );
    }

    pub fn handle_write(&mut self, req: FsReadWriteReq, bus: &mut dyn SignalBus) {
        let pages = req.pages.into_pages();
        if !self.open.contains(&req.file_pointer) {
            bus.send(
                req.user_ref,
                Reply::WriteRef(Self::missing(req.user_pointer), pages),
            );
            return;
        }
        bus.send(
            req.user_ref,
            Reply::WriteConf {
                user_pointer: req.user_pointer,
                pages,
            },
        );
    }

    pub fn handle_sync(&mut self, req: FsSyncReq, bus: &mut dyn SignalBus) {
        if !self.open.contains(&req.file_pointer) {
            bus.send(
                req.user_ref,
                Reply::SyncRef(Self::missing(req.user_pointer)),
            );
            return;
        }
        bus.send(
            req.user_ref,
            Reply::SyncConf {
                user_pointer: req.user_pointer,
            },
        );
    }

    pub fn handle_append(&mut self, req: FsAppendReq, bus: &mut dyn SignalBus) {
        if !self.open.contains(&req.file_pointer) {
            bus.send(
                req.user_ref,
                Reply::AppendRef(Self::missing(req.user_pointer)),
            );
            return;
        }
        bus.send(
            req.user_ref,
            Reply::AppendConf {
                user_pointer: req.user_pointer,
                bytes: req.data.len() as u32,
            },
        );
    }

    pub fn handle_remove(&mut self, req: FsRemoveReq, bus: &mut dyn SignalBus) {
        bus.send(
            req.user_ref,
            Reply::RemoveConf {
                user_pointer: req.user_pointer,
            },
        );
    }

    pub fn handle_suspend(&mut self, _req: FsSuspendOrd) {}

    pub fn handle_alloc_mem(&mut self, req: AllocMemReq, bus: &mut dyn SignalBus) {
        bus.send(
            req.sender_ref,
            Reply::AllocMemConf {
                sender_data: req.sender_data,
                bytes: 0,
            },
        );
    }

    /// Index builds still run; only the storage below them is absent.
    pub fn handle_build_index(&mut self, req: BuildIndexReq, bus: &mut dyn SignalBus) {
        let mut buffer = vec![0u8; req.buffer_size as usize];
        match (req.func)(&mut buffer) {
            Ok(()) => bus.send(
                req.sender_ref,
                Reply::BuildIndexConf {
                    sender_data: req.sender_data,
                },
            ),
            Err(error) => bus.send(
                req.sender_ref,
                Reply::BuildIndexRef {
                    sender_data: req.sender_data,
                    error,
                },
            ),
        }
    }
}
