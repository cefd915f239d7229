//! The Write-Ahead Log.
//!
//! An append-only file of length-framed records. The log is the durability
//! authority: a transaction is committed exactly when its commit record is
//! durably on disk. Records are only durable after [`Wal::flush`] returns.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;

use crate::codec::Codec;
use crate::error::{Error, Result};

/// Operation kinds as encoded on disk. The numbering is stable across
/// versions. `CompareAndSet` is reserved: the primary write path records
/// conditional updates as `Insert`/`Update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OpKind {
    Insert = 0,
    Update = 1,
    Delete = 2,
    CompareAndSet = 3,
    TxBegin = 4,
    TxCommit = 5,
    TxRollback = 6,
}

impl OpKind {
    pub fn from_u32(value: u32) -> Option<OpKind> {
        match value {
            0 => Some(OpKind::Insert),
            1 => Some(OpKind::Update),
            2 => Some(OpKind::Delete),
            3 => Some(OpKind::CompareAndSet),
            4 => Some(OpKind::TxBegin),
            5 => Some(OpKind::TxCommit),
            6 => Some(OpKind::TxRollback),
            _ => None,
        }
    }

    /// True for record kinds that carry key/value payloads.
    pub fn is_data(self) -> bool {
        matches!(
            self,
            OpKind::Insert | OpKind::Update | OpKind::Delete | OpKind::CompareAndSet
        )
    }
}

/// A single log record. `timestamp_ms` is written for audit tooling and
/// never read back for any decision.
#[derive(Debug, Clone)]
pub struct WalEntry<K, V> {
    pub sequence: u64,
    pub transaction_id: u64,
    pub op: OpKind,
    pub timestamp_ms: u64,
    pub key: Option<K>,
    pub value: Option<V>,
    pub old_value: Option<V>,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl<K, V> WalEntry<K, V> {
    /// A data record. The sequence is stamped by [`Wal::append`].
    pub fn data(
        transaction_id: u64,
        op: OpKind,
        key: K,
        value: Option<V>,
        old_value: Option<V>,
    ) -> Self {
        WalEntry {
            sequence: 0,
            transaction_id,
            op,
            timestamp_ms: now_millis(),
            key: Some(key),
            value,
            old_value,
        }
    }

    /// A transaction marker record (begin, commit, rollback).
    pub fn marker(transaction_id: u64, op: OpKind) -> Self {
        WalEntry {
            sequence: 0,
            transaction_id,
            op,
            timestamp_ms: now_millis(),
            key: None,
            value: None,
            old_value: None,
        }
    }
}

/// File-backed WAL. A single lock serializes append, flush and truncate so
/// frames land atomically and sequence numbers are gap-free in disk order.
pub struct Wal<K, V> {
    path: PathBuf,
    key_codec: Arc<dyn Codec<K>>,
    value_codec: Arc<dyn Codec<V>>,
    sequence: AtomicU64,
    writer: Mutex<BufWriter<File>>,
}

impl<K, V> Wal<K, V> {
    /// Opens the log, scanning any existing records to initialize the
    /// sequence counter past the highest one found.
    pub fn open<P: AsRef<Path>>(
        path: P,
        key_codec: Arc<dyn Codec<K>>,
        value_codec: Arc<dyn Codec<V>>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let (entries, valid_len) = read_entries(&path, &*key_codec, &*value_codec)?;
        let mut last_sequence = 0;
        for entry in &entries {
            last_sequence = last_sequence.max(entry.sequence);
        }

        // Drop a partially written trailing frame (a crash point) so that
        // later appends remain readable.
        let file_len = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        if valid_len < file_len {
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(valid_len)?;
            file.sync_data()?;
        }

        let file = OpenOptions::new().append(true).create(true).open(&path)?;

        Ok(Wal {
            path,
            key_codec,
            value_codec,
            sequence: AtomicU64::new(last_sequence),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stamps the entry with the next sequence number and appends it. The
    /// record is not durable until [`Wal::flush`] returns.
    pub fn append(&self, entry: &mut WalEntry<K, V>) -> Result<u64> {
        let mut writer = self.writer.lock();
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        entry.sequence = sequence;

        let body = encode_entry(entry, &*self.key_codec, &*self.value_codec)?;
        writer.write_all(&(body.len() as u32).to_be_bytes())?;
        writer.write_all(&body)?;
        Ok(sequence)
    }

    /// Flushes buffered records and fsyncs file data.
    pub fn flush(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Reads every record in the log.
    pub fn read_all(&self) -> Result<Vec<WalEntry<K, V>>> {
        self.read_from_sequence(0)
    }

    /// Reads every record with `sequence >= from`.
    pub fn read_from_sequence(&self, from: u64) -> Result<Vec<WalEntry<K, V>>> {
        {
            let mut writer = self.writer.lock();
            writer.flush()?;
        }
        let (entries, _) = read_entries(&self.path, &*self.key_codec, &*self.value_codec)?;
        Ok(entries
            .into_iter()
            .filter(|entry| entry.sequence >= from)
            .collect())
    }

    /// Keeps only records with `sequence >= before`, rewriting the log to a
    /// fresh file and atomically replacing the old one.
    pub fn truncate_before(&self, before: u64) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;

        let survivors: Vec<WalEntry<K, V>> =
            read_entries(&self.path, &*self.key_codec, &*self.value_codec)?
                .0
                .into_iter()
                .filter(|entry| entry.sequence >= before)
                .collect();

        let mut tmp_path = self.path.clone();
        tmp_path.set_extension("tmp");
        {
            let tmp = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            let mut tmp_writer = BufWriter::new(tmp);
            for entry in &survivors {
                let body = encode_entry(entry, &*self.key_codec, &*self.value_codec)?;
                tmp_writer.write_all(&(body.len() as u32).to_be_bytes())?;
                tmp_writer.write_all(&body)?;
            }
            tmp_writer.flush()?;
            tmp_writer.get_ref().sync_data()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        *writer = BufWriter::new(file);
        Ok(())
    }

    /// Flushes and releases the log.
    pub fn close(&self) -> Result<()> {
        self.flush()
    }
}

impl<K, V> Drop for Wal<K, V> {
    fn drop(&mut self) {
        let mut writer = self.writer.lock();
        let _ = writer.flush();
        let _ = writer.get_ref().sync_data();
    }
}

fn encode_slot(buf: &mut BytesMut, bytes: Option<Vec<u8>>) {
    match bytes {
        Some(bytes) => {
            buf.put_u32(bytes.len() as u32);
            buf.put_slice(&bytes);
        }
        None => buf.put_u32(0),
    }
}

fn encode_entry<K, V>(
    entry: &WalEntry<K, V>,
    key_codec: &dyn Codec<K>,
    value_codec: &dyn Codec<V>,
) -> Result<Vec<u8>> {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u64(entry.sequence);
    buf.put_u64(entry.transaction_id);
    buf.put_u32(entry.op as u32);
    buf.put_u64(entry.timestamp_ms);

    encode_slot(&mut buf, entry.key.as_ref().map(|k| key_codec.encode(k)).transpose()?);
    encode_slot(&mut buf, entry.value.as_ref().map(|v| value_codec.encode(v)).transpose()?);
    encode_slot(
        &mut buf,
        entry.old_value.as_ref().map(|v| value_codec.encode(v)).transpose()?,
    );

    Ok(buf.to_vec())
}

fn need(buf: &impl Buf, n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(Error::corruption("log record body truncated"));
    }
    Ok(())
}

fn decode_slot(buf: &mut &[u8]) -> Result<Option<bytes::Bytes>> {
    need(buf, 4)?;
    let len = buf.get_u32() as usize;
    if len == 0 {
        return Ok(None);
    }
    need(buf, len)?;
    Ok(Some(buf.copy_to_bytes(len)))
}

fn decode_entry<K, V>(
    data: &[u8],
    key_codec: &dyn Codec<K>,
    value_codec: &dyn Codec<V>,
) -> Result<WalEntry<K, V>> {
    let mut buf = data;
    need(&buf, 8 + 8 + 4 + 8)?;
    let sequence = buf.get_u64();
    let transaction_id = buf.get_u64();
    let op_raw = buf.get_u32();
    let timestamp_ms = buf.get_u64();

    let op = OpKind::from_u32(op_raw)
        .ok_or_else(|| Error::corruption(format!("unknown log operation kind {op_raw}")))?;

    let key = decode_slot(&mut buf)?.map(|b| key_codec.decode(&b)).transpose()?;
    let value = decode_slot(&mut buf)?.map(|b| value_codec.decode(&b)).transpose()?;
    let old_value = decode_slot(&mut buf)?.map(|b| value_codec.decode(&b)).transpose()?;

    Ok(WalEntry {
        sequence,
        transaction_id,
        op,
        timestamp_ms,
        key,
        value,
        old_value,
    })
}

/// Reads until EOF or a partially written trailing frame, also returning the
/// byte length of the complete prefix. A frame cut off at the length prefix
/// or mid-body is a crash point: scanning stops and the partial record is
/// ignored. A complete frame that fails to decode is corruption and aborts
/// the read.
fn read_entries<K, V>(
    path: &Path,
    key_codec: &dyn Codec<K>,
    value_codec: &dyn Codec<V>,
) -> Result<(Vec<WalEntry<K, V>>, u64)> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e.into()),
    };

    let mut entries = Vec::new();
    let mut valid_len = 0u64;
    loop {
        let mut len_buf = [0u8; 4];
        if !read_full(&mut file, &mut len_buf)? {
            break;
        }
        let len = u32::from_be_bytes(len_buf) as usize;

        let mut body = vec![0u8; len];
        if !read_full(&mut file, &mut body)? {
            break;
        }

        entries.push(decode_entry(&body, key_codec, value_codec)?);
        valid_len += 4 + len as u64;
    }
    Ok((entries, valid_len))
}

/// Fills `buf` from the reader; returns false if EOF arrives first.
fn read_full(file: &mut File, buf: &mut [u8]) -> Result<bool> {
    let mut read = 0;
    while read < buf.len() {
        match file.read(&mut buf[read..])? {
            0 => return Ok(false),
            n => read += n,
        }
    }
    Ok(true)
}
