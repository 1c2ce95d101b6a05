pub mod datagram;
pub mod fs_watcher;
pub mod trusted_stream;
