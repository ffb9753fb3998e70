//! Orbis syscall numbers

// Process
pub const SYS_EXIT: u64 = 1;
pub const SYS_GETPID: u64 = 20;
pub const SYS_SYSARCH: u64 = 165;
pub const SYS_MNAME: u64 = 588;
pub const SYS_GET_AUTHINFO: u64 = 587;
pub const SYS_MDBG_SERVICE: u64 = 608;
pub const SYS_RANDOMIZED_PATH: u64 = 610;
pub const SYS_GET_PROC_TYPE_INFO: u64 = 622;
pub const SYS_WORKAROUND8849: u64 = 639;
pub const SYS_REGMGR_CALL: u64 = 533;
pub const SYS_SYSCTL: u64 = 202;

// File descriptors
pub const SYS_WRITE: u64 = 4;
pub const SYS_OPEN: u64 = 5;
pub const SYS_CLOSE: u64 = 6;
pub const SYS_IOCTL: u64 = 54;

// Memory
pub const SYS_MUNMAP: u64 = 73;
pub const SYS_MPROTECT: u64 = 74;
pub const SYS_MMAP: u64 = 477;
pub const SYS_FTRUNCATE: u64 = 480;
pub const SYS_SHM_OPEN: u64 = 482;
pub const SYS_DMEM_CONTAINER: u64 = 586;

// Network
pub const SYS_SOCKET: u64 = 97;
pub const SYS_CONNECT: u64 = 98;
pub const SYS_SOCKETEX: u64 = 113;
pub const SYS_SOCKETCLOSE: u64 = 114;
pub const SYS_NETCONTROL: u64 = 125;

// Time
pub const SYS_GETTIMEOFDAY: u64 = 116;
pub const SYS_CLOCK_GETTIME: u64 = 232;
pub const SYS_UTC_TO_LOCALTIME: u64 = 638;

// Signals
pub const SYS_SIGPROCMASK: u64 = 340;
pub const SYS_SIGACTION: u64 = 416;

// Threads
pub const SYS_THR_SELF: u64 = 432;
pub const SYS_UMTX_OP: u64 = 454;
pub const SYS_THR_SET_NAME: u64 = 464;
pub const SYS_RTPRIO_THREAD: u64 = 466;
pub const SYS_CPUSET_GETAFFINITY: u64 = 487;
pub const SYS_THR_GET_NAME: u64 = 626;

// Synchronization
pub const SYS_KQUEUE: u64 = 362;
pub const SYS_EVF_CREATE: u64 = 538;
pub const SYS_EVF_DELETE: u64 = 539;
pub const SYS_EVF_OPEN: u64 = 540;
pub const SYS_OSEM_CREATE: u64 = 549;
pub const SYS_OSEM_DELETE: u64 = 550;
pub const SYS_OSEM_OPEN: u64 = 551;
pub const SYS_NAMEDOBJ_CREATE: u64 = 557;
pub const SYS_NAMEDOBJ_DELETE: u64 = 558;
pub const SYS_EPORT_CREATE: u64 = 613;

// Dynamic linking
pub const SYS_DYNLIB_DLSYM: u64 = 591;
pub const SYS_DYNLIB_GET_LIST: u64 = 592;
pub const SYS_DYNLIB_GET_INFO: u64 = 593;
pub const SYS_DYNLIB_LOAD_PRX: u64 = 594;
pub const SYS_DYNLIB_DO_COPY_RELOCATIONS: u64 = 596;
pub const SYS_DYNLIB_GET_PROC_PARAM: u64 = 599;
pub const SYS_DYNLIB_PROCESS_NEEDED_AND_RELOCATE: u64 = 600;
pub const SYS_DYNLIB_GET_INFO_EX: u64 = 612;
pub const SYS_DYNLIB_GET_OBJ_MEMBER: u64 = 649;

// IPMI
pub const SYS_IPMIMGR_CALL: u64 = 655;
