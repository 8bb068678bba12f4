use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use super::message::RequestClient;

/*
    Append-only log of every client request a replica has accepted, so a
    restarted replica still knows what it owes the clients. Each record is a
    little-endian u32 length followed by the bincode encoding of the request.
    A torn final record left by a crash is ignored on replay.
*/

const LEN_PREFIX: usize = 4;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("record at offset {offset} claims {len} bytes, only {available} left")]
    Truncated { offset: usize, len: usize, available: usize },
}

pub struct RequestWal {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl RequestWal {
    /// Opens the log for appending. A torn final record is cut off first so
    /// later appends start on a record boundary.
    pub fn open(path: &Path) -> Result<Self, WalError> {
        let file = OpenOptions::new().create(true).read(true).append(true).open(path)?;
        let mut buf = Vec::new();
        (&file).read_to_end(&mut buf)?;
        let (_, valid_end) = decode_all(&buf)?;
        if valid_end < buf.len() {
            warn!(path = %path.display(), valid_end, len = buf.len(), "truncating torn record at end of request log");
            file.set_len(valid_end as u64)?;
            file.sync_data()?;
        }
        debug!(path = %path.display(), "request log opened");
        Ok(RequestWal {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn append(&mut self, request: &RequestClient) -> Result<(), WalError> {
        let bytes = bincode::serialize(request)?;
        self.writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
        self.writer.write_all(&bytes)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Every complete record in the log, oldest first.
    pub fn replay(&self) -> Result<Vec<RequestClient>, WalError> {
        let mut buf = Vec::new();
        File::open(&self.path)?.read_to_end(&mut buf)?;
        let (requests, _) = decode_all(&buf)?;
        Ok(requests)
    }
}

/// Complete records and the offset just past the last of them.
fn decode_all(buf: &[u8]) -> Result<(Vec<RequestClient>, usize), WalError> {
    let mut requests = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        match decode_record(buf, offset) {
            Ok((request, next)) => {
                requests.push(request);
                offset = next;
            }
            Err(WalError::Truncated { offset, len, available }) => {
                warn!(offset, len, available, "ignoring torn record at end of request log");
                break;
            }
            Err(err) => return Err(err),
        }
    }
    Ok((requests, offset))
}

fn decode_record(buf: &[u8], offset: usize) -> Result<(RequestClient, usize), WalError> {
    let available = buf.len() - offset;
    if available < LEN_PREFIX {
        return Err(WalError::Truncated { offset, len: LEN_PREFIX, available });
    }
    let mut prefix = [0u8; LEN_PREFIX];
    prefix.copy_from_slice(&buf[offset..offset + LEN_PREFIX]);
    let len = u32::from_le_bytes(prefix) as usize;

    let start = offset + LEN_PREFIX;
    if buf.len() - start < len {
        return Err(WalError::Truncated { offset, len, available: buf.len() - start });
    }
    let request = bincode::deserialize(&buf[start..start + len])?;
    Ok((request, start + len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requests.wal");

        let mut wal = RequestWal::open(&path).unwrap();
        wal.append(&RequestClient::new("c", 1, b"op1".to_vec())).unwrap();
        wal.append(&RequestClient::new("c", 2, b"op2".to_vec())).unwrap();
        drop(wal);

        let wal = RequestWal::open(&path).unwrap();
        let requests = wal.replay().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].timestamp, 1);
        assert_eq!(requests[1].op, b"op2".to_vec());
    }

    #[test]
    fn test_replay_ignores_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requests.wal");

        let mut wal = RequestWal::open(&path).unwrap();
        wal.append(&RequestClient::new("c", 1, b"op1".to_vec())).unwrap();
        drop(wal);

        // Length prefix promising more bytes than were written.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&64u32.to_le_bytes()).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();
        drop(file);

        let wal = RequestWal::open(&path).unwrap();
        let requests = wal.replay().unwrap();
        assert_eq!(requests, vec![RequestClient::new("c", 1, b"op1".to_vec())]);
    }

    #[test]
    fn test_append_after_torn_tail_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requests.wal");

        let mut wal = RequestWal::open(&path).unwrap();
        wal.append(&RequestClient::new("c", 1, b"op1".to_vec())).unwrap();
        drop(wal);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&64u32.to_le_bytes()).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();
        drop(file);

        let mut wal = RequestWal::open(&path).unwrap();
        assert_eq!(wal.replay().unwrap().len(), 1);
        wal.append(&RequestClient::new("c", 2, b"op2".to_vec())).unwrap();
        drop(wal);

        let wal = RequestWal::open(&path).unwrap();
        let requests = wal.replay().unwrap();
        assert_eq!(
            requests,
            vec![RequestClient::new("c", 1, b"op1".to_vec()), RequestClient::new("c", 2, b"op2".to_vec())]
        );
    }

    #[test]
    fn test_replay_empty_log() {
        let dir = tempfile::tempdir().unwrap();
        let wal = RequestWal::open(&dir.path().join("empty.wal")).unwrap();
        assert!(wal.replay().unwrap().is_empty());
    }
}
