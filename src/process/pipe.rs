//! Pipe reader: turns one named pipe's byte stream into UTF-8 text chunks.

use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use tracing::{debug, warn};

const READ_BUFFER_SIZE: usize = 8192;

/// Open the read end of a named pipe without waiting for a writer.
///
/// The descriptor is switched back to blocking mode before it is returned.
/// Holding the read end before the child starts lets the child open its
/// write end immediately, and keeps bytes written by a short-lived child in
/// the pipe until they are drained.
pub fn open_reader(path: &Path) -> io::Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .custom_flags(nix::libc::O_NONBLOCK)
        .open(path)?;

    let fd = file.as_raw_fd();
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags & !OFlag::O_NONBLOCK))?;
    Ok(file)
}

/// Read `source` until end of stream, handing every decoded chunk to
/// `on_chunk`.
///
/// Chunks follow read boundaries, not line boundaries. An I/O failure is
/// logged and reported once through `on_failure`, which ends the drain.
pub fn drain<R, C, F>(mut source: R, name: &str, on_chunk: C, on_failure: F)
where
    R: Read,
    C: Fn(&str),
    F: Fn(&str),
{
    let mut decoder = Utf8Decoder::default();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        match source.read(&mut buf) {
            Ok(0) => {
                if let Some(rest) = decoder.finish() {
                    on_chunk(&rest);
                }
                debug!(pipe = name, "pipe reached end of stream");
                return;
            }
            Ok(n) => {
                let text = decoder.decode(&buf[..n]);
                if !text.is_empty() {
                    on_chunk(&text);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let message = "Could not handle iperf output";
                warn!(pipe = name, error = %e, "{}", message);
                on_failure(&format!("{}: {:?} ({})", message, e.kind(), e));
                return;
            }
        }
    }
}

/// Incremental UTF-8 decoder that carries an incomplete trailing character
/// over to the next read.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut out = String::with_capacity(self.pending.len());
        let mut input = &self.pending[..];
        loop {
            match std::str::from_utf8(input) {
                Ok(valid) => {
                    out.push_str(valid);
                    input = &[];
                    break;
                }
                Err(e) => {
                    let (valid, rest) = input.split_at(e.valid_up_to());
                    // valid_up_to guarantees this prefix is UTF-8
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            input = &rest[len..];
                        }
                        None => {
                            input = rest;
                            break;
                        }
                    }
                }
            }
        }

        let carried = input.to_vec();
        self.pending = carried;
        out
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(rest)
    }
}
