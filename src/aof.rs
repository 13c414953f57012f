use std::fs::{metadata, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{bounded, Receiver, Sender};
use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};
use tempfile::NamedTempFile;

use crate::db::DB;
use crate::entity::entity_to_cmd;
use crate::error::{Error, Result};
use crate::reply::{cmd_line, CmdLine, Reply};

pub const AOF_QUEUE_SIZE: usize = 1 << 16;

/// The append-only log: a file handle owned by one writer thread, the
/// pause gate that lets a rewrite exclude that writer, and the rewrite
/// buffer that double-writes commands arriving mid-rewrite.
pub struct Aof {
    filename: PathBuf,
    file: Mutex<File>,
    /// Normal appends hold this shared; rewrite start/finish hold it
    /// exclusively to freeze the file and the buffer.
    pausing: RwLock<()>,
    rewrite_buf: Mutex<Option<(Sender<CmdLine>, Receiver<CmdLine>)>>,
}

impl Aof {
    pub fn open(filename: PathBuf) -> Result<Aof> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&filename)?;
        Ok(Aof {
            filename,
            file: Mutex::new(file),
            pausing: RwLock::new(()),
            rewrite_buf: Mutex::new(None),
        })
    }

    pub fn filename(&self) -> &Path {
        &self.filename
    }

    /// Spawns the writer draining `rx` to disk. Closing the channel
    /// drains the thread, which then signals the returned channel.
    pub fn start_writer(self: &Arc<Self>, rx: Receiver<CmdLine>) -> Receiver<()> {
        let aof = self.clone();
        let (done_tx, done_rx) = bounded(1);
        let spawned = thread::Builder::new()
            .name("aof-writer".to_string())
            .spawn(move || {
                for cmd in rx.iter() {
                    aof.append(&cmd);
                }
                let _ = done_tx.send(());
            });
        if let Err(e) = spawned {
            error!("can't spawn aof writer: {}", e);
        }
        done_rx
    }

    fn append(&self, cmd: &CmdLine) {
        let _gate = self.pausing.read();
        let buf_tx = self
            .rewrite_buf
            .lock()
            .as_ref()
            .map(|(tx, _)| tx.clone());
        if let Some(tx) = buf_tx {
            if tx.try_send(cmd.clone()).is_err() {
                warn!("aof rewrite buffer is full, dropping duplicate");
            }
        }
        let bytes = Reply::MultiBulk(cmd.clone()).to_bytes();
        if let Err(e) = self.file.lock().write_all(&bytes) {
            warn!("aof write failed: {}", e);
        }
    }

    /// Produces a log equivalent to the current state: snapshot the
    /// prefix, replay it into a throwaway store, serialize that store,
    /// then splice in everything that arrived mid-rewrite.
    pub fn rewrite(&self) -> Result<()> {
        let (mut tmp, size) = self.start_rewrite()?;

        let tmp_db = DB::memory();
        tmp_db.load_aof(&self.filename, Some(size));
        tmp_db.data.for_each(|key, entity| {
            if let Some(cmd) = entity_to_cmd(key, &entity.read()) {
                let _ = tmp.write_all(&Reply::MultiBulk(cmd).to_bytes());
            }
            true
        });
        tmp_db.ttl.for_each(|key, at| {
            let cmd = make_expire_cmd(key, *at);
            let _ = tmp.write_all(&Reply::MultiBulk(cmd).to_bytes());
            true
        });

        self.finish_rewrite(tmp)?;
        info!("aof rewrite finished");
        Ok(())
    }

    /// Freezes appends long enough to fsync, snapshot the log size and
    /// install the rewrite buffer. Appends resume as soon as this
    /// returns; the buffer records them.
    pub(crate) fn start_rewrite(&self) -> Result<(NamedTempFile, u64)> {
        let _pause = self.pausing.write();
        self.file.lock().sync_all()?;
        let size = metadata(&self.filename)?.len();
        *self.rewrite_buf.lock() = Some(bounded(AOF_QUEUE_SIZE));
        let dir = self
            .filename
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let tmp = NamedTempFile::new_in(dir)?;
        Ok((tmp, size))
    }

    /// Drains the rewrite buffer into the temp file (the gate keeps it
    /// from growing), tears the buffer down and swaps the temp file over
    /// the live log.
    pub(crate) fn finish_rewrite(&self, mut tmp: NamedTempFile) -> Result<()> {
        let _pause = self.pausing.write();
        if let Some((_, rx)) = self.rewrite_buf.lock().as_ref() {
            while let Ok(cmd) = rx.try_recv() {
                tmp.write_all(&Reply::MultiBulk(cmd).to_bytes())?;
            }
        }
        *self.rewrite_buf.lock() = None;

        tmp.flush()?;
        let mut file = self.file.lock();
        tmp.persist(&self.filename)
            .map_err(|e| Error::Io(e.error))?;
        *file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.filename)?;
        Ok(())
    }
}

/// TTLs persist only in this shape: an absolute millisecond deadline.
pub fn make_expire_cmd(key: &str, at_ms: u64) -> CmdLine {
    cmd_line(
        "PEXPIREAT",
        &[key.as_bytes().to_vec(), at_ms.to_string().into_bytes()],
    )
}
