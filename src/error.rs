// Kernel error handling and errno definitions.
//
// Every fallible operation in the kernel returns one of these POSIX-style
// kinds. The syscall layer negates them into a0.

/// Closed set of kernel error kinds, with their POSIX numeric values.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    EPERM = 1,       // Operation not permitted
    ENOENT = 2,      // No such file or directory
    ESRCH = 3,       // No such process
    EINTR = 4,       // Interrupted system call
    EIO = 5,         // I/O error
    ENOEXEC = 8,     // Exec format error
    EBADF = 9,       // Bad file descriptor
    ECHILD = 10,     // No child processes
    EAGAIN = 11,     // Try again / would block
    ENOMEM = 12,     // Out of memory
    EACCES = 13,     // Permission denied
    EFAULT = 14,     // Bad address
    EBUSY = 16,      // Device or resource busy
    EEXIST = 17,     // File exists
    EXDEV = 18,      // Cross-device link
    ENOTDIR = 20,    // Not a directory
    EISDIR = 21,     // Is a directory
    EINVAL = 22,     // Invalid argument
    ENOSPC = 28,     // No space left on device
    EPIPE = 32,      // Broken pipe
    ENOTEMPTY = 39,  // Directory not empty
    ENOTSUP = 95,    // Operation not supported
}

impl Errno {
    /// The value placed in a0 by a failing syscall.
    pub fn as_isize(self) -> isize {
        -(self as i32 as isize)
    }

    pub fn description(self) -> &'static str {
        match self {
            Errno::EPERM => "Operation not permitted",
            Errno::ENOENT => "No such file or directory",
            Errno::ESRCH => "No such process",
            Errno::EINTR => "Interrupted system call",
            Errno::EIO => "I/O error",
            Errno::ENOEXEC => "Exec format error",
            Errno::EBADF => "Bad file descriptor",
            Errno::ECHILD => "No child processes",
            Errno::EAGAIN => "Try again",
            Errno::ENOMEM => "Out of memory",
            Errno::EACCES => "Permission denied",
            Errno::EFAULT => "Bad address",
            Errno::EBUSY => "Device or resource busy",
            Errno::EEXIST => "File exists",
            Errno::EXDEV => "Cross-device link",
            Errno::ENOTDIR => "Not a directory",
            Errno::EISDIR => "Is a directory",
            Errno::EINVAL => "Invalid argument",
            Errno::ENOSPC => "No space left on device",
            Errno::EPIPE => "Broken pipe",
            Errno::ENOTEMPTY => "Directory not empty",
            Errno::ENOTSUP => "Operation not supported",
        }
    }
}

pub type Result<T> = core::result::Result<T, Errno>;
