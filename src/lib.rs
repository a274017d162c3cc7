//! nvfs — a userspace cluster filesystem for kernel-bypass block devices.
//!
//! The device is partitioned into block groups, each carrying its own
//! bitmaps and inode table. One control-plane process owns the device and
//! the free pool; data-plane worker processes lease block groups
//! ("containers") from it over ring-based IPC and serve workloads out of
//! them, with crash-safe metadata maintained through an ordered
//! dirty-flush pipeline.
//!
//! Entry points: [`fs::mount::format`] writes a fresh filesystem,
//! [`fs::FileSystem::mount`] attaches a process in one of the three
//! [`fs::ProcessRole`]s, and the metadata API on [`fs::FileSystem`]
//! (create, mkdir, lookup, unlink, rename, readdir, truncate, ...) does
//! the rest.

pub mod drivers;
pub mod err;
pub mod fs;
pub mod ipc;

pub use err::{CanFail, FsError, IoResult};
pub use fs::{FileSystem, MountParams, ProcessRole};
