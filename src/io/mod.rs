/*
 * Input/Output System
 *
 * The file abstraction (console endpoints + filesystem streams) and the
 * per-process file descriptor table built on it.
 */

pub mod fd;
pub mod file;

pub use fd::FdTable;
pub use file::File;
