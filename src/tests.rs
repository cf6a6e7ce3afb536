//! End-to-end scenarios driven through the syscall ABI.
//!
//! One shared kernel environment (page pool, hart 0, a MINIX root
//! filesystem on a RAM disk) backs every scenario; a global lock keeps
//! them sequential since they share the mount table and process table.

use crate::mm::address_space::MapPerms;
use crate::process::signal::{SigAction, Signal};
use crate::process::{self, Process};
use crate::syscall::{self, uaccess, SyscallReturn};
use crate::task::{hart, Reg, Task, TaskState, DEFAULT_PRIORITY, KERNEL_STACK_SIZE};
use crate::vfs::node::FileType;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use spin::Once;

static ENV: Once<()> = Once::new();

fn scenario_lock() -> spin::MutexGuard<'static, ()> {
    hart::test_support::serialize_scheduler()
}

/// Scratch window mapped into every test process.
const USER_BASE: usize = 0x10_0000;
const USER_PAGES: usize = 16;

fn setup_env() {
    ENV.call_once(|| {
        crate::mm::test_support::ensure_page_pool();
        hart::test_support::ensure_hart();
        let device = crate::fs::minix::testfs::mkfs(4096, 128);
        let sb = crate::fs::minix::create_minix_superblock(device).unwrap();
        crate::vfs::mount::mount_root(sb).unwrap();
    });
}

fn make_process() -> (Arc<Task>, Arc<Process>) {
    let process = Process::new_user(None).unwrap();
    let task = Task::new(DEFAULT_PRIORITY);
    task.attach_stack(KERNEL_STACK_SIZE);
    *task.process.lock() = Some(process.clone());
    *process.task.lock() = Arc::downgrade(&task);
    process
        .space()
        .allocate_range(
            USER_BASE,
            USER_PAGES * crate::mm::PAGE_SIZE,
            USER_PAGES * crate::mm::PAGE_SIZE,
            MapPerms::READ | MapPerms::WRITE,
        )
        .unwrap();
    (task, process)
}

fn put_cstr(process: &Arc<Process>, addr: usize, text: &str) {
    let space = process.space();
    uaccess::copy_to_user(&space, addr, text.as_bytes()).unwrap();
    uaccess::copy_to_user(&space, addr + text.len(), &[0]).unwrap();
}

fn syscall(task: &Arc<Task>, nr: usize, args: &[usize]) -> SyscallReturn {
    {
        let mut frame = task.frame.lock();
        frame.set(Reg::A0, nr);
        for (index, arg) in args.iter().enumerate() {
            frame.regs[Reg::A1 as usize + index] = *arg;
        }
    }
    syscall::dispatch(task, false)
}

fn retval(task: &Arc<Task>) -> isize {
    task.frame.lock().get(Reg::A0) as isize
}

#[test]
fn scenario_echo_then_cat() {
    setup_env();
    let _serial = scenario_lock();
    let (task, process) = make_process();

    // mkdir /tmp (mknod with a directory mode).
    put_cstr(&process, USER_BASE, "/tmp");
    syscall(
        &task,
        syscall::SYSCALL_MKNOD,
        &[USER_BASE, (FileType::Dir.to_mode() | 0o777) as usize, 0],
    );
    assert_eq!(retval(&task), 0);

    // echo "Hello world!" > /tmp/test.txt
    put_cstr(&process, USER_BASE, "/tmp/test.txt");
    let open_flags = (crate::vfs::OpenFlags::WRITE | crate::vfs::OpenFlags::CREATE).bits() as usize;
    syscall(&task, syscall::SYSCALL_OPEN, &[USER_BASE, open_flags, 0o644]);
    let fd = retval(&task);
    assert!(fd >= 0, "open failed: {}", fd);
    put_cstr(&process, USER_BASE + 0x100, "Hello world!");
    syscall(
        &task,
        syscall::SYSCALL_WRITE,
        &[fd as usize, USER_BASE + 0x100, 12],
    );
    assert_eq!(retval(&task), 12);
    syscall(&task, syscall::SYSCALL_CLOSE, &[fd as usize]);
    assert_eq!(retval(&task), 0);

    // cat /tmp/test.txt
    syscall(
        &task,
        syscall::SYSCALL_OPEN,
        &[USER_BASE, crate::vfs::OpenFlags::READ.bits() as usize, 0],
    );
    let fd = retval(&task);
    assert!(fd >= 0);
    syscall(
        &task,
        syscall::SYSCALL_READ,
        &[fd as usize, USER_BASE + 0x200, 64],
    );
    assert_eq!(retval(&task), 12);
    let mut back = [0u8; 12];
    uaccess::copy_from_user(&process.space(), USER_BASE + 0x200, &mut back).unwrap();
    assert_eq!(&back, b"Hello world!");

    // seek back and stat through the same descriptor.
    syscall(&task, syscall::SYSCALL_SEEK, &[fd as usize, 0, 0]);
    assert_eq!(retval(&task), 0);
    syscall(&task, syscall::SYSCALL_STAT, &[fd as usize, USER_BASE + 0x300]);
    assert_eq!(retval(&task), 0);
    let mut size_bytes = [0u8; 8];
    uaccess::copy_from_user(&process.space(), USER_BASE + 0x300 + 48, &mut size_bytes).unwrap();
    assert_eq!(u64::from_le_bytes(size_bytes), 12);
    syscall(&task, syscall::SYSCALL_CLOSE, &[fd as usize]);

    process::exit_process(&process, 0);
}

#[test]
fn scenario_fork_and_wait_status() {
    setup_env();
    let _serial = scenario_lock();
    let (task, process) = make_process();

    assert_eq!(syscall(&task, syscall::SYSCALL_FORK, &[]), SyscallReturn::Continue);
    let child_pid = retval(&task);
    assert!(child_pid > 0);
    let child = process::process_by_pid(child_pid as i32).unwrap();
    let child_task = child.main_task().unwrap();
    // The child sees 0 in a0.
    assert_eq!(child_task.frame.lock().get(Reg::A0), 0);

    // Child exits with code 7; parent waits and decodes the status.
    syscall(&child_task, syscall::SYSCALL_EXIT, &[7]);
    syscall(
        &task,
        syscall::SYSCALL_WAIT,
        &[child_pid as usize, USER_BASE + 0x40, 0],
    );
    assert_eq!(retval(&task), child_pid);
    let status = uaccess::read_user_usize(&process.space(), USER_BASE + 0x40).unwrap() as u32;
    let status = status & 0xffff_ffff;
    assert_eq!(status & 0x7f, 0, "not signalled");
    assert_eq!((status >> 8) & 0xff, 7, "exit code");

    // No children left: ECHILD.
    syscall(&task, syscall::SYSCALL_WAIT, &[usize::MAX, 0, 0]);
    assert_eq!(retval(&task), crate::Errno::ECHILD.as_isize());

    process::exit_process(&process, 0);
    // Drain anything the scenario enqueued.
    let hart = hart::test_support::ensure_hart();
    while let Some(t) = hart.queue.pull() {
        let _ = t;
    }
}

#[test]
fn scenario_pipe_between_tasks() {
    setup_env();
    let _serial = scenario_lock();
    let (task, process) = make_process();

    syscall(&task, syscall::SYSCALL_PIPE, &[USER_BASE]);
    assert_eq!(retval(&task), 0);
    let space = process.space();
    let mut fds = [0u8; 8];
    uaccess::copy_from_user(&space, USER_BASE, &mut fds).unwrap();
    let read_fd = i32::from_le_bytes(fds[0..4].try_into().unwrap()) as usize;
    let write_fd = i32::from_le_bytes(fds[4..8].try_into().unwrap()) as usize;

    // Reader blocks first: the read parks with no data available.
    let outcome = syscall(&task, syscall::SYSCALL_READ, &[read_fd, USER_BASE + 0x100, 16]);
    assert_eq!(outcome, SyscallReturn::Park);
    assert_eq!(task.state(), TaskState::Waiting);

    // A second task sharing the process writes into the pipe; the
    // completion delivers into the parked reader.
    let writer = Task::new(DEFAULT_PRIORITY);
    writer.attach_stack(KERNEL_STACK_SIZE);
    *writer.process.lock() = Some(process.clone());
    put_cstr(&process, USER_BASE + 0x200, "HELLO");
    syscall(&writer, syscall::SYSCALL_WRITE, &[write_fd, USER_BASE + 0x200, 5]);
    assert_eq!(retval(&writer), 5);

    // The reader's a0 got the byte count and its buffer the payload.
    assert_eq!(retval(&task), 5);
    let mut back = [0u8; 5];
    uaccess::copy_from_user(&space, USER_BASE + 0x100, &mut back).unwrap();
    assert_eq!(&back, b"HELLO");
    assert_eq!(task.state(), TaskState::Ready);

    // Closing the write end makes further reads see end of stream.
    syscall(&task, syscall::SYSCALL_CLOSE, &[write_fd]);
    syscall(&task, syscall::SYSCALL_READ, &[read_fd, USER_BASE + 0x100, 16]);
    assert_eq!(retval(&task), 0);

    process::exit_process(&process, 0);
    let hart = hart::test_support::ensure_hart();
    while let Some(t) = hart.queue.pull() {
        let _ = t;
    }
}

#[test]
fn scenario_signal_handler_runs_and_returns() {
    setup_env();
    let _serial = scenario_lock();
    let (task, process) = make_process();
    let handler_pc = 0x4_2000usize;
    let restorer_pc = 0x4_3000usize;

    // sigaction(SIGUSR2, handler)
    let action = SigAction {
        handler: handler_pc,
        mask: 0,
        flags: 0,
        _reserved: 0,
        restorer: restorer_pc,
    };
    uaccess::copy_to_user(&process.space(), USER_BASE + 0x80, &action.to_bytes()).unwrap();
    syscall(
        &task,
        syscall::SYSCALL_SIGACTION,
        &[Signal::SIGUSR2.to_u32() as usize, USER_BASE + 0x80, 0],
    );
    assert_eq!(retval(&task), 0);

    // Give the task a user stack inside the scratch window and a resume
    // point, then kill(self, SIGUSR2).
    {
        let mut frame = task.frame.lock();
        frame.set(Reg::Sp, USER_BASE + USER_PAGES * crate::mm::PAGE_SIZE);
        frame.pc = 0x4_1000;
    }
    syscall(
        &task,
        syscall::SYSCALL_KILL,
        &[process.pid as usize, Signal::SIGUSR2.to_u32() as usize],
    );
    assert_eq!(retval(&task), 0);
    assert!(crate::process::signal::handle_pending(&task, &process));
    {
        let frame = task.frame.lock();
        assert_eq!(frame.pc, handler_pc);
        assert_eq!(frame.get(Reg::A0), Signal::SIGUSR2.to_u32() as usize);
        assert_eq!(frame.get(Reg::Ra), restorer_pc);
    }
    // While handled, the signal is masked against itself.
    assert!(process.signals.mask() & (1 << (Signal::SIGUSR2.to_u32() - 1)) != 0);

    // The restorer issues sigreturn; the pre-signal context comes back.
    syscall(&task, syscall::SYSCALL_SIGRETURN, &[]);
    {
        let frame = task.frame.lock();
        assert_eq!(frame.pc, 0x4_1000);
    }
    assert_eq!(process.signals.mask(), 0);

    // The handler exits the process with code 42; wait-style status.
    process::exit_process(&process, process::exit_status(42));
    assert_eq!(process.status.load(core::sync::atomic::Ordering::Acquire), 42 << 8);
}

#[test]
fn scenario_blocked_signal_stays_pending_until_unmasked() {
    setup_env();
    let _serial = scenario_lock();
    let (task, process) = make_process();

    // Block SIGTERM, send it, nothing delivers.
    let bit = 1u64 << (Signal::SIGTERM.to_u32() - 1);
    syscall(&task, syscall::SYSCALL_SIGPROCMASK, &[1 /*BLOCK*/, bit as usize]);
    syscall(
        &task,
        syscall::SYSCALL_KILL,
        &[process.pid as usize, Signal::SIGTERM.to_u32() as usize],
    );
    assert_eq!(retval(&task), 0);
    assert!(crate::process::signal::handle_pending(&task, &process));
    assert!(process.main_task().is_some(), "survived while masked");

    // sigpending reports it.
    syscall(&task, syscall::SYSCALL_SIGPENDING, &[]);
    assert_eq!(retval(&task) as u64, bit);

    // Unblocking lets the default action (terminate) through.
    syscall(&task, syscall::SYSCALL_SIGPROCMASK, &[2 /*UNBLOCK*/, bit as usize]);
    assert!(!crate::process::signal::handle_pending(&task, &process));
    assert_eq!(
        process.status.load(core::sync::atomic::Ordering::Acquire),
        Signal::SIGTERM.to_u32() as i32
    );
}

#[test]
fn scenario_mount_and_umount() {
    setup_env();
    let _serial = scenario_lock();
    let (task, process) = make_process();

    // Register a second RAM disk carrying a fresh filesystem and expose
    // it as /dev/blk0.
    let inner_device_file = crate::fs::minix::testfs::mkfs(1024, 32);
    let disk_node = inner_device_file.node.clone();
    // Reach the RamDisk through a new registration: mkfs built it on a
    // RAM disk already; register that device for rdev lookup.
    let device_id = {
        // The block node wraps the device; re-wrap for the registry.
        struct NodeBacked(Arc<crate::vfs::VfsNode>);
        impl crate::dev::BlockDevice for NodeBacked {
            fn block_size(&self) -> usize {
                self.0.stat.lock().block_size
            }
            fn size(&self) -> usize {
                self.0.stat.lock().size
            }
            fn read(&self, buf: &mut [u8], offset: usize) -> crate::Result<()> {
                self.0.read_at(buf, offset).map(|_| ())
            }
            fn write(&self, buf: &[u8], offset: usize) -> crate::Result<()> {
                self.0.write_at(buf, offset).map(|_| ())
            }
        }
        crate::dev::register_block_device(Arc::new(NodeBacked(disk_node)))
    };

    put_cstr(&process, USER_BASE, "/dev");
    syscall(
        &task,
        syscall::SYSCALL_MKNOD,
        &[USER_BASE, (FileType::Dir.to_mode() | 0o755) as usize, 0],
    );
    put_cstr(&process, USER_BASE, "/dev/blk0");
    syscall(
        &task,
        syscall::SYSCALL_MKNOD,
        &[USER_BASE, (FileType::Block.to_mode() | 0o600) as usize, device_id],
    );
    assert_eq!(retval(&task), 0);
    put_cstr(&process, USER_BASE, "/mnt");
    syscall(
        &task,
        syscall::SYSCALL_MKNOD,
        &[USER_BASE, (FileType::Dir.to_mode() | 0o755) as usize, 0],
    );

    // mount /dev/blk0 /mnt minix
    put_cstr(&process, USER_BASE, "/dev/blk0");
    put_cstr(&process, USER_BASE + 0x40, "/mnt");
    put_cstr(&process, USER_BASE + 0x80, "minix");
    syscall(
        &task,
        syscall::SYSCALL_MOUNT,
        &[USER_BASE, USER_BASE + 0x40, USER_BASE + 0x80],
    );
    assert_eq!(retval(&task), 0);

    // A file created under /mnt lands on the mounted filesystem.
    put_cstr(&process, USER_BASE + 0x100, "/mnt/hello");
    let create = (crate::vfs::OpenFlags::WRITE | crate::vfs::OpenFlags::CREATE).bits() as usize;
    syscall(&task, syscall::SYSCALL_OPEN, &[USER_BASE + 0x100, create, 0o644]);
    let fd = retval(&task);
    assert!(fd >= 0);

    // umount refuses while the file is open, succeeds after close.
    syscall(&task, syscall::SYSCALL_UMOUNT, &[USER_BASE + 0x40]);
    assert_eq!(retval(&task), crate::Errno::EBUSY.as_isize());
    syscall(&task, syscall::SYSCALL_CLOSE, &[fd as usize]);
    syscall(&task, syscall::SYSCALL_UMOUNT, &[USER_BASE + 0x40]);
    assert_eq!(retval(&task), 0);

    // The name is gone with the mount.
    syscall(
        &task,
        syscall::SYSCALL_OPEN,
        &[USER_BASE + 0x100, crate::vfs::OpenFlags::READ.bits() as usize, 0],
    );
    assert_eq!(retval(&task), crate::Errno::ENOENT.as_isize());

    process::exit_process(&process, 0);
}

#[test]
fn scenario_write_to_protected_page_raises_sigsegv() {
    setup_env();
    let _serial = scenario_lock();
    let (task, process) = make_process();
    let hart = hart::test_support::ensure_hart();

    let buf = USER_BASE + 4 * crate::mm::PAGE_SIZE;
    // Fault the page in (write) first, then drop write permission.
    uaccess::copy_to_user(&process.space(), buf, b"x").unwrap();
    syscall(
        &task,
        syscall::SYSCALL_PROTECT,
        &[buf, crate::mm::PAGE_SIZE, syscall::mem::PROT_READ],
    );
    assert_eq!(retval(&task), 0);
    assert!(process.space().virt_to_phys(buf, true, false).is_none());

    // The trap path turns the store fault into SIGSEGV.
    let outcome =
        crate::trap::handle_task_trap(&hart, &task, crate::trap::TrapCause::StorePageFault(buf));
    assert_eq!(outcome, crate::trap::TrapOutcome::Schedule);
    assert!(!crate::process::signal::handle_pending(&task, &process));
    assert_eq!(
        process.status.load(core::sync::atomic::Ordering::Acquire) & 0x7f,
        Signal::SIGSEGV.to_u32() as i32
    );
    while let Some(t) = hart.queue.pull() {
        let _ = t;
    }
}

#[test]
fn scenario_sbrk_grows_the_heap() {
    setup_env();
    let _serial = scenario_lock();
    let (task, process) = make_process();
    process.space().set_start_brk(0x20_0000);

    syscall(&task, syscall::SYSCALL_SBRK, &[0x3000]);
    assert_eq!(retval(&task), 0x20_0000);
    // The fresh pages are zero and writable.
    let space = process.space();
    uaccess::copy_to_user(&space, 0x20_0000, b"heap").unwrap();
    let mut back = [0u8; 4];
    uaccess::copy_from_user(&space, 0x20_0000, &mut back).unwrap();
    assert_eq!(&back, b"heap");
    syscall(&task, syscall::SYSCALL_SBRK, &[0]);
    assert_eq!(retval(&task), 0x20_3000);

    process::exit_process(&process, 0);
}

#[test]
fn scenario_cwd_and_relative_paths() {
    setup_env();
    let _serial = scenario_lock();
    let (task, process) = make_process();

    put_cstr(&process, USER_BASE, "/home");
    syscall(
        &task,
        syscall::SYSCALL_MKNOD,
        &[USER_BASE, (FileType::Dir.to_mode() | 0o755) as usize, 0],
    );
    syscall(&task, syscall::SYSCALL_CHDIR, &[USER_BASE]);
    assert_eq!(retval(&task), 0);
    syscall(&task, syscall::SYSCALL_GETCWD, &[USER_BASE + 0x40, 64]);
    assert_eq!(retval(&task), 6);
    let cwd = uaccess::read_user_cstr(&process.space(), USER_BASE + 0x40, 64).unwrap();
    assert_eq!(cwd, "/home");

    // A relative create lands inside the cwd.
    put_cstr(&process, USER_BASE + 0x80, "notes.txt");
    let create = (crate::vfs::OpenFlags::WRITE | crate::vfs::OpenFlags::CREATE).bits() as usize;
    syscall(&task, syscall::SYSCALL_OPEN, &[USER_BASE + 0x80, create, 0o600]);
    let fd = retval(&task);
    assert!(fd >= 0);
    syscall(&task, syscall::SYSCALL_CLOSE, &[fd as usize]);
    put_cstr(&process, USER_BASE + 0x80, "/home/notes.txt");
    syscall(
        &task,
        syscall::SYSCALL_OPEN,
        &[USER_BASE + 0x80, crate::vfs::OpenFlags::READ.bits() as usize, 0],
    );
    assert!(retval(&task) >= 0);
    syscall(&task, syscall::SYSCALL_CLOSE, &[retval(&task) as usize]);

    process::exit_process(&process, 0);
}

#[test]
fn scenario_dup_shares_the_offset() {
    setup_env();
    let _serial = scenario_lock();
    let (task, process) = make_process();

    put_cstr(&process, USER_BASE, "/dupfile");
    let create = (crate::vfs::OpenFlags::WRITE
        | crate::vfs::OpenFlags::READ
        | crate::vfs::OpenFlags::CREATE)
        .bits() as usize;
    syscall(&task, syscall::SYSCALL_OPEN, &[USER_BASE, create, 0o644]);
    let fd = retval(&task) as usize;
    put_cstr(&process, USER_BASE + 0x40, "abcdef");
    syscall(&task, syscall::SYSCALL_WRITE, &[fd, USER_BASE + 0x40, 6]);
    syscall(&task, syscall::SYSCALL_DUP, &[fd]);
    let dup_fd = retval(&task) as usize;
    assert!(dup_fd != fd);
    // Both descriptors share one file object, hence one offset.
    syscall(&task, syscall::SYSCALL_SEEK, &[fd, 0, 0]);
    syscall(&task, syscall::SYSCALL_READ, &[dup_fd, USER_BASE + 0x80, 3]);
    assert_eq!(retval(&task), 3);
    syscall(&task, syscall::SYSCALL_READ, &[fd, USER_BASE + 0x90, 3]);
    assert_eq!(retval(&task), 3);
    let mut halves = [0u8; 6];
    uaccess::copy_from_user(&process.space(), USER_BASE + 0x80, &mut halves[0..3]).unwrap();
    uaccess::copy_from_user(&process.space(), USER_BASE + 0x90, &mut halves[3..6]).unwrap();
    assert_eq!(&halves, b"abcdef");

    syscall(&task, syscall::SYSCALL_CLOSE, &[fd]);
    syscall(&task, syscall::SYSCALL_CLOSE, &[dup_fd]);
    put_cstr(&process, USER_BASE, "/dupfile");
    syscall(&task, syscall::SYSCALL_UNLINK, &[USER_BASE]);
    assert_eq!(retval(&task), 0);
    process::exit_process(&process, 0);
}

#[test]
fn scenario_execve_replaces_the_image() {
    setup_env();
    let _serial = scenario_lock();
    let (task, process) = make_process();

    // Install a minimal executable at /prog through the filesystem.
    let body = b"\x73\x00\x00\x00"; // a single ecall
    let image = crate::process::exec::elf::testelf::build(0x10000, 0x10000, body);
    put_cstr(&process, USER_BASE, "/prog");
    let create = (crate::vfs::OpenFlags::WRITE | crate::vfs::OpenFlags::CREATE).bits() as usize;
    syscall(&task, syscall::SYSCALL_OPEN, &[USER_BASE, create, 0o755]);
    let fd = retval(&task) as usize;
    let space = process.space();
    uaccess::copy_to_user(&space, USER_BASE + 0x400, &image).unwrap();
    syscall(&task, syscall::SYSCALL_WRITE, &[fd, USER_BASE + 0x400, image.len()]);
    assert_eq!(retval(&task) as usize, image.len());
    syscall(&task, syscall::SYSCALL_CLOSE, &[fd]);

    // argv = ["/prog", NULL] in user memory.
    put_cstr(&process, USER_BASE + 0x40, "/prog");
    uaccess::copy_to_user(
        &space,
        USER_BASE + 0x60,
        &((USER_BASE + 0x40) as u64).to_le_bytes(),
    )
    .unwrap();
    uaccess::copy_to_user(&space, USER_BASE + 0x68, &0u64.to_le_bytes()).unwrap();

    let outcome = syscall(
        &task,
        syscall::SYSCALL_EXECVE,
        &[USER_BASE, USER_BASE + 0x60, 0],
    );
    assert_eq!(outcome, SyscallReturn::Continue);
    let (pc, argc, argv_addr, sp) = {
        let frame = task.frame.lock();
        (
            frame.pc,
            frame.get(Reg::A0),
            frame.get(Reg::A1),
            frame.get(Reg::Sp),
        )
    };
    assert_eq!(pc, 0x10000, "entry point");
    assert_eq!(argc, 1);
    assert_eq!(sp, argv_addr);
    // The fresh image carries the segment and the argument string.
    let new_space = process.space();
    let mut seg = [0u8; 4];
    uaccess::copy_from_user(&new_space, 0x10000, &mut seg).unwrap();
    assert_eq!(&seg, body);
    let arg0 = uaccess::read_user_usize(&new_space, argv_addr).unwrap();
    assert_eq!(
        uaccess::read_user_cstr(&new_space, arg0, 64).unwrap(),
        "/prog"
    );
    // The old scratch window is gone with the old address space.
    assert!(new_space.virt_to_phys(USER_BASE, false, false).is_none());

    process::exit_process(&process, 0);
}

#[test]
fn scenario_readdir_lists_created_entries() {
    setup_env();
    let _serial = scenario_lock();
    let (task, process) = make_process();

    put_cstr(&process, USER_BASE, "/lsdir");
    syscall(
        &task,
        syscall::SYSCALL_MKNOD,
        &[USER_BASE, (FileType::Dir.to_mode() | 0o755) as usize, 0],
    );
    for name in ["/lsdir/one", "/lsdir/two"] {
        put_cstr(&process, USER_BASE, name);
        let create =
            (crate::vfs::OpenFlags::WRITE | crate::vfs::OpenFlags::CREATE).bits() as usize;
        syscall(&task, syscall::SYSCALL_OPEN, &[USER_BASE, create, 0o644]);
        let fd = retval(&task) as usize;
        syscall(&task, syscall::SYSCALL_CLOSE, &[fd]);
    }

    put_cstr(&process, USER_BASE, "/lsdir");
    syscall(
        &task,
        syscall::SYSCALL_OPEN,
        &[USER_BASE, crate::vfs::OpenFlags::READ.bits() as usize, 0],
    );
    let fd = retval(&task) as usize;
    let mut names = vec![];
    loop {
        syscall(&task, syscall::SYSCALL_READDIR, &[fd, USER_BASE + 0x200, 128]);
        let len = retval(&task);
        if len == 0 {
            break;
        }
        assert!(len > 19);
        let name =
            uaccess::read_user_cstr(&process.space(), USER_BASE + 0x200 + 19, 64).unwrap();
        names.push(name);
    }
    names.sort();
    assert_eq!(names, vec![String::from("one"), String::from("two")]);
    syscall(&task, syscall::SYSCALL_CLOSE, &[fd]);
    process::exit_process(&process, 0);
}
