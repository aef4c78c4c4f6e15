//! End to end scenarios driving the block against real temp directories.
//!
//! A recording bus stands in for the node's signal dispatcher: replies are
//! collected in a queue and continuations are delivered at their due time,
//! so the reply scan runs exactly the way the scheduler would run it.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use asyncfs::{
    Afs, AfsConfig, AllocMemReq, BlockRef, BuildIndexReq, ContinueB, ErrorKind, FileSpec,
    FsAppendReq, FsCloseReq, FsOpenReq, FsReadWriteReq, FsRemoveReq, FsSuspendOrd, FsSyncReq,
    HeapPool, OpenFlags, Page, PageList, Reply, SignalBus, Suffix, DumpOrd, LOCAL_ERROR,
    NO_COUNT, NO_VAL_8,
};
use tempfile::TempDir;

/// DBTUP on node 7.
const CALLER: BlockRef = 249 << 16 | 7;

struct TestBus {
    replies: Vec<(BlockRef, Reply)>,
    continuations: Vec<(Instant, ContinueB)>,
}

impl TestBus {
    fn new() -> TestBus {
        TestBus {
            replies: Vec::new(),
            continuations: Vec::new(),
        }
    }
}

impl SignalBus for TestBus {
    fn send(&mut self, dest: BlockRef, reply: Reply) {
        self.replies.push((dest, reply));
    }

    fn send_continueb(&mut self, delay_ms: u32, sig: ContinueB) {
        self.continuations
            .push((Instant::now() + Duration::from_millis(u64::from(delay_ms)), sig));
    }
}

/// Deliver continuations in due-time order until the block emits a reply.
fn pump(afs: &mut Afs, bus: &mut TestBus) -> Reply {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if !bus.replies.is_empty() {
            return bus.replies.remove(0).1;
        }
        assert!(Instant::now() < deadline, "timed out waiting for a reply");
        let next = bus
            .continuations
            .iter()
            .enumerate()
            .min_by_key(|(_, (at, _))| *at)
            .map(|(i, _)| i)
            .expect("no continuation pending");
        let (at, sig) = bus.continuations.remove(next);
        let now = Instant::now();
        if at > now {
            std::thread::sleep(at - now);
        }
        afs.handle_continueb(sig, bus);
    }
}

fn setup(configure: impl FnOnce(&mut AfsConfig)) -> (Afs, TestBus, TempDir) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let mut cfg = AfsConfig::new(7, dir.path());
    cfg.initial_files = 2;
    cfg.pooled_threads = 2;
    configure(&mut cfg);
    let mut afs = Afs::new(cfg, Arc::new(HeapPool::new(0)));
    let mut bus = TestBus::new();
    afs.start(&mut bus);
    (afs, bus, dir)
}

fn data_spec(disk: u32, table: u32, fragment: u32, s: u32) -> [u32; 4] {
    FileSpec::V1 {
        disk,
        table,
        fragment,
        s,
        p: NO_VAL_8,
        suffix: Suffix::Data,
    }
    .encode()
}

fn open_req(file_number: [u32; 4], flags: OpenFlags, user_pointer: u32) -> FsOpenReq {
    FsOpenReq {
        user_ref: CALLER,
        user_pointer,
        file_number,
        name: None,
        file_flags: flags,
        page_size: 32768,
        file_size: 0,
        auto_sync_size: 0,
        trace: 0,
    }
}

fn open(afs: &mut Afs, bus: &mut TestBus, req: FsOpenReq) -> u16 {
    afs.handle_open(req, bus);
    match pump(afs, bus) {
        Reply::OpenConf { file_pointer, .. } => file_pointer,
        other => panic!("open failed: {other:?}"),
    }
}

fn close(afs: &mut Afs, bus: &mut TestBus, handle: u16, remove: bool) {
    afs.handle_close(
        FsCloseReq {
            user_ref: CALLER,
            user_pointer: 0,
            file_pointer: handle,
            remove,
            trace: 0,
        },
        bus,
    );
    match pump(afs, bus) {
        Reply::CloseConf { .. } => {}
        other => panic!("close failed: {other:?}"),
    }
}

fn write_pages(afs: &mut Afs, bus: &mut TestBus, handle: u16, pages: PageList, sync: bool) -> Reply {
    afs.handle_write(
        FsReadWriteReq {
            user_ref: CALLER,
            user_pointer: 0,
            file_pointer: handle,
            pages,
            sync,
            partial: false,
            trace: 0,
        },
        bus,
    );
    pump(afs, bus)
}

fn read_pages(
    afs: &mut Afs,
    bus: &mut TestBus,
    handle: u16,
    pages: PageList,
    partial: bool,
) -> Reply {
    afs.handle_read(
        FsReadWriteReq {
            user_ref: CALLER,
            user_pointer: 0,
            file_pointer: handle,
            pages,
            sync: false,
            partial,
            trace: 0,
        },
        bus,
    );
    pump(afs, bus)
}

fn append(afs: &mut Afs, bus: &mut TestBus, handle: u16, data: Vec<u8>, sync: bool) -> Reply {
    afs.handle_append(
        FsAppendReq {
            user_ref: CALLER,
            user_pointer: 0,
            file_pointer: handle,
            data,
            sync,
            trace: 0,
        },
        bus,
    );
    pump(afs, bus)
}

#[test]
fn write_then_read_back_sequential_pages() {
    let (mut afs, mut bus, dir) = setup(|_| {});
    let spec = data_spec(1, 5, 0, 0);

    let handle = open(
        &mut afs,
        &mut bus,
        open_req(
            spec,
            OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::READWRITE,
            1,
        ),
    );
    assert_eq!(afs.open_file_count(), 1);
    assert_eq!(
        afs.get_filename(handle),
        dir.path()
            .join("ndb_7_fs/D1/DBTUP/T5/F0/S0.Data")
            .to_string_lossy()
            .into_owned()
    );

    let pages: Vec<(Page, u64)> = (0..4u8)
        .map(|i| (Page::from_bytes(&[i; 32768]), u64::from(i) * 32768))
        .collect();
    match write_pages(&mut afs, &mut bus, handle, PageList::ListOfPairs(pages), false) {
        Reply::WriteConf { pages, .. } => assert_eq!(pages.len(), 4),
        other => panic!("write failed: {other:?}"),
    }
    close(&mut afs, &mut bus, handle, false);
    assert_eq!(afs.open_file_count(), 0);

    let handle = open(&mut afs, &mut bus, open_req(spec, OpenFlags::empty(), 2));
    let fresh: Vec<(Page, u64)> = (0..4u8)
        .map(|i| (Page::zeroed(32768), u64::from(i) * 32768))
        .collect();
    match read_pages(&mut afs, &mut bus, handle, PageList::ListOfPairs(fresh), false) {
        Reply::ReadConf { pages, bytes_read, .. } => {
            assert_eq!(bytes_read, None);
            for (i, page) in pages.iter().enumerate() {
                assert!(page.iter().all(|b| *b == i as u8), "page {i} mismatch");
            }
        }
        other => panic!("read failed: {other:?}"),
    }
    close(&mut afs, &mut bus, handle, false);
}

#[test]
fn partial_read_at_end_of_file() {
    let (mut afs, mut bus, _dir) = setup(|_| {});
    let spec = data_spec(0, 1, 0, 0);

    let handle = open(
        &mut afs,
        &mut bus,
        open_req(
            spec,
            OpenFlags::CREATE | OpenFlags::READWRITE | OpenFlags::APPEND,
            1,
        ),
    );
    match append(&mut afs, &mut bus, handle, vec![0xAB; 10_000], false) {
        Reply::AppendConf { bytes, .. } => assert_eq!(bytes, 10_000),
        other => panic!("append failed: {other:?}"),
    }
    close(&mut afs, &mut bus, handle, false);

    let handle = open(&mut afs, &mut bus, open_req(spec, OpenFlags::empty(), 2));
    let page = Page::zeroed(4000);
    match read_pages(
        &mut afs,
        &mut bus,
        handle,
        PageList::ArrayOfPages {
            buf: page,
            offset: 8000,
        },
        true,
    ) {
        Reply::ReadConf {
            bytes_read, pages, ..
        } => {
            assert_eq!(bytes_read, Some(2000));
            assert!(pages[0][..2000].iter().all(|b| *b == 0xAB));
        }
        other => panic!("partial read failed: {other:?}"),
    }

    // The same read without the partial flag is an underflow.
    let page = Page::zeroed(4000);
    match read_pages(
        &mut afs,
        &mut bus,
        handle,
        PageList::ArrayOfPages {
            buf: page,
            offset: 8000,
        },
        false,
    ) {
        Reply::ReadRef(fs_ref, pages) => {
            assert_eq!(fs_ref.error, ErrorKind::ReadUnderflow);
            assert_eq!(fs_ref.os_error, LOCAL_ERROR);
            assert_eq!(pages.len(), 1);
        }
        other => panic!("expected an underflow, got {other:?}"),
    }
    close(&mut afs, &mut bus, handle, false);
}

#[test]
fn append_grows_the_file_and_survives_close() {
    let (mut afs, mut bus, dir) = setup(|_| {});
    let spec = data_spec(0, 2, 0, 0);

    let mut req = open_req(
        spec,
        OpenFlags::CREATE | OpenFlags::READWRITE | OpenFlags::APPEND | OpenFlags::SYNC,
        1,
    );
    req.auto_sync_size = 4096;
    let handle = open(&mut afs, &mut bus, req);

    for i in 0..10u8 {
        match append(&mut afs, &mut bus, handle, vec![i; 1000], false) {
            Reply::AppendConf { bytes, .. } => assert_eq!(bytes, 1000),
            other => panic!("append {i} failed: {other:?}"),
        }
    }
    close(&mut afs, &mut bus, handle, false);

    let on_disk =
        std::fs::read(dir.path().join("ndb_7_fs/D0/DBTUP/T2/F0/S0.Data")).unwrap();
    assert_eq!(on_disk.len(), 10_000);
    for i in 0..10usize {
        assert!(on_disk[i * 1000..(i + 1) * 1000].iter().all(|b| *b == i as u8));
    }
}

#[test]
fn vectored_write_and_read() {
    let (mut afs, mut bus, _dir) = setup(|_| {});
    let spec = data_spec(0, 3, 1, 0);

    let handle = open(
        &mut afs,
        &mut bus,
        open_req(
            spec,
            OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::READWRITE,
            1,
        ),
    );
    let pages: Vec<Page> = (0..3u8).map(|i| Page::from_bytes(&[i + 1; 8192])).collect();
    match write_pages(
        &mut afs,
        &mut bus,
        handle,
        PageList::ListOfMemPages { pages, offset: 0 },
        true,
    ) {
        Reply::WriteConf { pages, .. } => assert_eq!(pages.len(), 3),
        other => panic!("vectored write failed: {other:?}"),
    }

    let fresh: Vec<Page> = (0..3).map(|_| Page::zeroed(8192)).collect();
    match read_pages(
        &mut afs,
        &mut bus,
        handle,
        PageList::ListOfMemPages {
            pages: fresh,
            offset: 0,
        },
        false,
    ) {
        Reply::ReadConf { pages, .. } => {
            for (i, page) in pages.iter().enumerate() {
                assert!(page.iter().all(|b| *b == i as u8 + 1), "page {i} mismatch");
            }
        }
        other => panic!("vectored read failed: {other:?}"),
    }
    close(&mut afs, &mut bus, handle, false);
}

#[test]
fn sync_request_and_close_remove() {
    let (mut afs, mut bus, dir) = setup(|_| {});
    let spec = data_spec(0, 4, 0, 0);

    let handle = open(
        &mut afs,
        &mut bus,
        open_req(
            spec,
            OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::READWRITE,
            1,
        ),
    );
    match write_pages(
        &mut afs,
        &mut bus,
        handle,
        PageList::ArrayOfPages {
            buf: Page::from_bytes(&[7; 4096]),
            offset: 0,
        },
        false,
    ) {
        Reply::WriteConf { .. } => {}
        other => panic!("write failed: {other:?}"),
    }
    afs.handle_sync(
        FsSyncReq {
            user_ref: CALLER,
            user_pointer: 9,
            file_pointer: handle,
            trace: 0,
        },
        &mut bus,
    );
    match pump(&mut afs, &mut bus) {
        Reply::SyncConf { user_pointer } => assert_eq!(user_pointer, 9),
        other => panic!("sync failed: {other:?}"),
    }

    let path = dir.path().join("ndb_7_fs/D0/DBTUP/T4/F0/S0.Data");
    assert!(path.exists());
    close(&mut afs, &mut bus, handle, true);
    assert!(!path.exists(), "close-remove must unlink the file");
}

#[test]
fn recursive_remove_is_idempotent() {
    let (mut afs, mut bus, dir) = setup(|_| {});

    let backup_dir = dir.path().join("ndb_7_fs/BACKUP/BACKUP-12");
    std::fs::create_dir_all(&backup_dir).unwrap();
    for name in ["BACKUP-12.7.ctl", "BACKUP-12-0.7.Data", "BACKUP-12.7.log"] {
        std::fs::write(backup_dir.join(name), b"payload").unwrap();
    }

    let spec = FileSpec::V2 {
        sequence: 12,
        node_id: 7,
        part: 0,
        total_parts: 0,
        count: NO_COUNT,
        suffix: Suffix::Ctl,
    }
    .encode();
    let remove = |afs: &mut Afs, bus: &mut TestBus| {
        afs.handle_remove(
            FsRemoveReq {
                user_ref: CALLER,
                user_pointer: 5,
                file_number: spec,
                name: None,
                directory: true,
                own_directory: true,
                trace: 0,
            },
            bus,
        );
        pump(afs, bus)
    };

    match remove(&mut afs, &mut bus) {
        Reply::RemoveConf { user_pointer } => assert_eq!(user_pointer, 5),
        other => panic!("remove failed: {other:?}"),
    }
    assert!(!backup_dir.exists());

    // Absence of the directory is not an error for rmrf.
    match remove(&mut afs, &mut bus) {
        Reply::RemoveConf { .. } => {}
        other => panic!("repeated remove failed: {other:?}"),
    }
}

#[test]
fn open_creates_missing_parent_directories() {
    let (mut afs, mut bus, dir) = setup(|_| {});
    let spec = data_spec(0, 1, 0, 0);
    assert!(!dir.path().join("ndb_7_fs/D0").exists());

    let handle = open(
        &mut afs,
        &mut bus,
        open_req(spec, OpenFlags::CREATE | OpenFlags::READWRITE, 1),
    );
    assert!(dir.path().join("ndb_7_fs/D0/DBTUP/T1/F0/S0.Data").is_file());
    close(&mut afs, &mut bus, handle, false);

    // The removed tree grows back on the next create-if-none open.
    afs.handle_remove(
        FsRemoveReq {
            user_ref: CALLER,
            user_pointer: 0,
            file_number: FileSpec::V1 {
                disk: 0,
                table: 1,
                fragment: 0,
                s: 0,
                p: NO_VAL_8,
                suffix: Suffix::Data,
            }
            .encode(),
            name: None,
            directory: true,
            own_directory: true,
            trace: 0,
        },
        &mut bus,
    );
    match pump(&mut afs, &mut bus) {
        Reply::RemoveConf { .. } => {}
        other => panic!("remove failed: {other:?}"),
    }
    let handle = open(
        &mut afs,
        &mut bus,
        open_req(spec, OpenFlags::CREATE_IF_NONE | OpenFlags::READWRITE, 2),
    );
    close(&mut afs, &mut bus, handle, false);
}

#[test]
fn open_of_missing_file_is_refused_with_the_os_error() {
    let (mut afs, mut bus, _dir) = setup(|_| {});
    let idle_before = afs.idle_file_count();

    afs.handle_open(
        open_req(data_spec(0, 5, 0, 0), OpenFlags::empty(), 1),
        &mut bus,
    );
    match pump(&mut afs, &mut bus) {
        Reply::OpenRef(fs_ref) => {
            assert_eq!(fs_ref.error, ErrorKind::FileDoesNotExist);
            assert_eq!(fs_ref.os_error, libc::ENOENT as u32);
        }
        other => panic!("expected a refusal, got {other:?}"),
    }
    assert_eq!(afs.idle_file_count(), idle_before, "the file must return to idle");
    assert_eq!(afs.open_file_count(), 0);
}

#[test]
fn file_pre_allocation_zero_fills() {
    let (mut afs, mut bus, dir) = setup(|_| {});
    let spec = data_spec(0, 6, 0, 0);

    let mut req = open_req(
        spec,
        OpenFlags::CREATE | OpenFlags::READWRITE | OpenFlags::INIT,
        1,
    );
    req.file_size = 100_000;
    let handle = open(&mut afs, &mut bus, req);
    close(&mut afs, &mut bus, handle, false);

    let on_disk = std::fs::read(dir.path().join("ndb_7_fs/D0/DBTUP/T6/F0/S0.Data")).unwrap();
    assert_eq!(on_disk.len(), 100_000);
    assert!(on_disk.iter().all(|b| *b == 0));
}

#[test]
fn pre_allocation_without_pages_is_refused() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let mut cfg = AfsConfig::new(7, dir.path());
    cfg.initial_files = 1;
    cfg.pooled_threads = 1;
    // Too small for the 16 page pre-allocation buffer.
    let mut afs = Afs::new(cfg, Arc::new(HeapPool::new(8)));
    let mut bus = TestBus::new();
    afs.start(&mut bus);

    let idle_before = afs.idle_file_count();
    let mut req = open_req(
        data_spec(0, 7, 0, 0),
        OpenFlags::CREATE | OpenFlags::READWRITE | OpenFlags::INIT,
        1,
    );
    req.file_size = 65536;
    afs.handle_open(req, &mut bus);
    match bus.replies.remove(0).1 {
        Reply::OpenRef(fs_ref) => {
            assert_eq!(fs_ref.error, ErrorKind::OutOfMemory);
            assert_eq!(fs_ref.os_error, LOCAL_ERROR);
        }
        other => panic!("expected a refusal, got {other:?}"),
    }
    assert_eq!(afs.idle_file_count(), idle_before);
}

#[test]
fn requests_on_unknown_handles_are_refused() {
    let (mut afs, mut bus, _dir) = setup(|_| {});

    afs.handle_close(
        FsCloseReq {
            user_ref: CALLER,
            user_pointer: 1,
            file_pointer: 4711,
            remove: false,
            trace: 0,
        },
        &mut bus,
    );
    match bus.replies.remove(0).1 {
        Reply::CloseRef(fs_ref) => {
            assert_eq!(fs_ref.error, ErrorKind::FileDoesNotExist);
            assert_eq!(fs_ref.os_error, LOCAL_ERROR);
        }
        other => panic!("expected a refusal, got {other:?}"),
    }

    // Loaned pages come back with the refusal.
    afs.handle_read(
        FsReadWriteReq {
            user_ref: CALLER,
            user_pointer: 2,
            file_pointer: 4711,
            pages: PageList::ArrayOfPages {
                buf: Page::zeroed(512),
                offset: 0,
            },
            sync: false,
            partial: false,
            trace: 0,
        },
        &mut bus,
    );
    match bus.replies.remove(0).1 {
        Reply::ReadRef(fs_ref, pages) => {
            assert_eq!(fs_ref.error, ErrorKind::FileDoesNotExist);
            assert_eq!(pages.len(), 1);
        }
        other => panic!("expected a refusal, got {other:?}"),
    }
}

#[test]
fn pooled_files_execute_in_request_order() {
    let (mut afs, mut bus, _dir) = setup(|_| {});
    let spec = data_spec(0, 8, 0, 0);

    let handle = open(
        &mut afs,
        &mut bus,
        open_req(
            spec,
            OpenFlags::CREATE
                | OpenFlags::TRUNCATE
                | OpenFlags::READWRITE
                | OpenFlags::THREAD_POOL,
            1,
        ),
    );

    // Burst of writes on the pooled file; replies must come back one per
    // request with the final contents reflecting the last write.
    for round in 0..3u8 {
        afs.handle_write(
            FsReadWriteReq {
                user_ref: CALLER,
                user_pointer: u32::from(round),
                file_pointer: handle,
                pages: PageList::ArrayOfPages {
                    buf: Page::from_bytes(&[round; 4096]),
                    offset: 0,
                },
                sync: false,
                partial: false,
                trace: 0,
            },
            &mut bus,
        );
    }
    for _ in 0..3 {
        match pump(&mut afs, &mut bus) {
            Reply::WriteConf { .. } => {}
            other => panic!("pooled write failed: {other:?}"),
        }
    }

    match read_pages(
        &mut afs,
        &mut bus,
        handle,
        PageList::ArrayOfPages {
            buf: Page::zeroed(4096),
            offset: 0,
        },
        false,
    ) {
        Reply::ReadConf { pages, .. } => assert!(pages[0].iter().all(|b| *b == 2)),
        other => panic!("pooled read failed: {other:?}"),
    }
    close(&mut afs, &mut bus, handle, false);
}

#[test]
fn suspend_delays_but_preserves_order() {
    let (mut afs, mut bus, _dir) = setup(|_| {});
    let spec = data_spec(0, 9, 0, 0);

    let handle = open(
        &mut afs,
        &mut bus,
        open_req(
            spec,
            OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::READWRITE,
            1,
        ),
    );
    afs.handle_suspend(FsSuspendOrd {
        file_pointer: handle,
        milliseconds: 50,
        trace: 0,
    });
    let started = Instant::now();
    afs.handle_sync(
        FsSyncReq {
            user_ref: CALLER,
            user_pointer: 1,
            file_pointer: handle,
            trace: 0,
        },
        &mut bus,
    );
    match pump(&mut afs, &mut bus) {
        Reply::SyncConf { .. } => {}
        other => panic!("sync after suspend failed: {other:?}"),
    }
    assert!(
        started.elapsed() >= Duration::from_millis(50),
        "the sync must queue behind the suspended worker"
    );
    close(&mut afs, &mut bus, handle, false);
}

#[test]
fn alloc_mem_and_index_build_run_off_the_signal_thread() {
    let (mut afs, mut bus, _dir) = setup(|_| {});

    afs.handle_alloc_mem(
        AllocMemReq {
            sender_ref: CALLER,
            sender_data: 11,
            memlock: false,
            trace: 0,
        },
        &mut bus,
    );
    match pump(&mut afs, &mut bus) {
        Reply::AllocMemConf { sender_data, .. } => assert_eq!(sender_data, 11),
        other => panic!("alloc failed: {other:?}"),
    }

    let ran = Arc::new(AtomicBool::new(false));
    let witness = Arc::clone(&ran);
    afs.handle_build_index(
        BuildIndexReq {
            sender_ref: CALLER,
            sender_data: 12,
            buffer_size: 100_000,
            func: Box::new(move |buffer| {
                assert!(buffer.len() >= 100_000);
                buffer[..4].copy_from_slice(&[1, 2, 3, 4]);
                witness.store(true, Ordering::SeqCst);
                Ok(())
            }),
            trace: 0,
        },
        &mut bus,
    );
    match pump(&mut afs, &mut bus) {
        Reply::BuildIndexConf { sender_data } => assert_eq!(sender_data, 12),
        other => panic!("index build failed: {other:?}"),
    }
    assert!(ran.load(Ordering::SeqCst));

    afs.handle_build_index(
        BuildIndexReq {
            sender_ref: CALLER,
            sender_data: 13,
            buffer_size: 4096,
            func: Box::new(|_| Err(4242)),
            trace: 0,
        },
        &mut bus,
    );
    match pump(&mut afs, &mut bus) {
        Reply::BuildIndexRef { sender_data, error } => {
            assert_eq!(sender_data, 13);
            assert_eq!(error, 4242);
        }
        other => panic!("expected an index build refusal, got {other:?}"),
    }
}

#[test]
fn exceeding_the_file_cap_is_fatal() {
    let (mut afs, mut bus, _dir) = setup(|cfg| {
        cfg.max_files = 4;
        cfg.initial_files = 1;
    });

    let mut handles = Vec::new();
    for table in 0..4 {
        handles.push(open(
            &mut afs,
            &mut bus,
            open_req(
                data_spec(0, table, 0, 0),
                OpenFlags::CREATE | OpenFlags::READWRITE,
                table,
            ),
        ));
    }
    assert_eq!(afs.open_file_count(), 4);
    assert_eq!(afs.max_opened_files(), 4);

    let fifth = open_req(
        data_spec(0, 9, 0, 0),
        OpenFlags::CREATE | OpenFlags::READWRITE,
        9,
    );
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
        afs.handle_open(fifth, &mut bus);
    }));
    assert!(result.is_err(), "the fifth open must abort the node");

    for handle in handles {
        close(&mut afs, &mut bus, handle, false);
    }
}

#[test]
fn handles_are_not_reused_while_live() {
    let (mut afs, mut bus, _dir) = setup(|_| {});

    let a = open(
        &mut afs,
        &mut bus,
        open_req(
            data_spec(0, 20, 0, 0),
            OpenFlags::CREATE | OpenFlags::READWRITE,
            1,
        ),
    );
    let b = open(
        &mut afs,
        &mut bus,
        open_req(
            data_spec(0, 21, 0, 0),
            OpenFlags::CREATE | OpenFlags::READWRITE,
            2,
        ),
    );
    assert_ne!(a, b);
    close(&mut afs, &mut bus, a, false);

    // The freed handle is not handed out again before the space wraps.
    let c = open(
        &mut afs,
        &mut bus,
        open_req(
            data_spec(0, 22, 0, 0),
            OpenFlags::CREATE | OpenFlags::READWRITE,
            3,
        ),
    );
    assert_ne!(c, a);
    assert_ne!(c, b);
    close(&mut afs, &mut bus, b, false);
    close(&mut afs, &mut bus, c, false);
}

#[test]
fn dump_commands_report_state() {
    let (mut afs, mut bus, _dir) = setup(|_| {});
    let handle = open(
        &mut afs,
        &mut bus,
        open_req(
            data_spec(0, 30, 0, 0),
            OpenFlags::CREATE | OpenFlags::READWRITE,
            1,
        ),
    );

    afs.handle_dump(DumpOrd::FileStat);
    afs.handle_dump(DumpOrd::OpenFiles);
    afs.handle_dump(DumpOrd::AllFiles);
    afs.handle_dump(DumpOrd::IdleFiles);
    afs.handle_dump(DumpOrd::InspectFile(handle));
    afs.handle_dump(DumpOrd::SetSyncFreq(1 << 20));
    afs.handle_dump(DumpOrd::ToggleOSync);
    afs.handle_dump(DumpOrd::ToggleOSync);

    close(&mut afs, &mut bus, handle, false);
}
