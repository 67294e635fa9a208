use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use memmap2::{Mmap, MmapMut, MmapOptions};

/// Default segment size: 200 MiB.
pub const DEFAULT_SEGMENT_SIZE: usize = 200 * 1024 * 1024;

/// Per-record framing: flag(1) + id(8 BE) + len(4 BE).
pub const RECORD_HEADER: usize = 13;

const FLAG_VALID: u8 = b'v';
const PAGE_SIZE: usize = 4096;

#[derive(thiserror::Error, Debug)]
pub enum SpoolError {
    #[error("payload of {len} bytes exceeds segment capacity of {cap} bytes")]
    PayloadTooLarge { len: usize, cap: usize },

    #[error("corrupt record in segment {fid} at offset {offset}")]
    CorruptRecord { fid: u64, offset: usize },

    #[error("segment size {0} must be a non-zero multiple of the page size")]
    BadSegmentSize(usize),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// A durable single-producer / single-consumer byte log for one named queue.
///
/// Records are appended to fixed-size memory-mapped segment files
/// `<name>_<fid>.log`. A segment that cannot fit the next record is sealed
/// and a new one opened; a sealed segment is deleted once the reader has
/// consumed it in full. Positions are process-local: a fresh `Spool` starts
/// from segment 1 regardless of what is on disk.
#[derive(Debug)]
pub struct Spool {
    name: String,
    dir: PathBuf,
    segment_size: usize,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    writer: Writer,
    reader: Reader,
}

#[derive(Debug)]
struct Writer {
    fid: u64,
    offset: usize,
    map: Option<MmapMut>,
    // fid -> published byte count; SEGMENT_SIZE once the segment is sealed
    wmap: HashMap<u64, usize>,
}

#[derive(Debug)]
struct Reader {
    fid: u64,
    offset: usize,
    map: Option<Mmap>,
}

impl Spool {
    pub fn open(
        dir: impl AsRef<Path>,
        name: impl Into<String>,
        segment_size: usize,
    ) -> Result<Self, SpoolError> {
        if segment_size == 0 || segment_size % PAGE_SIZE != 0 {
            return Err(SpoolError::BadSegmentSize(segment_size));
        }
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        Ok(Self {
            name: name.into(),
            dir,
            segment_size,
            inner: Mutex::new(Inner {
                writer: Writer {
                    fid: 0,
                    offset: 0,
                    map: None,
                    wmap: HashMap::new(),
                },
                reader: Reader {
                    fid: 0,
                    offset: 0,
                    map: None,
                },
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub fn segment_path(&self, fid: u64) -> PathBuf {
        self.dir.join(format!("{}_{}.log", self.name, fid))
    }

    /// Append one record. Fails without touching queue state if the payload
    /// cannot fit in a single segment.
    pub fn write(&self, id: u64, payload: &[u8]) -> Result<(), SpoolError> {
        let need = RECORD_HEADER + payload.len();
        if need > self.segment_size {
            return Err(SpoolError::PayloadTooLarge {
                len: payload.len(),
                cap: self.segment_size - RECORD_HEADER,
            });
        }

        let mut guard = self.inner.lock().expect("spool lock poisoned");
        let w = &mut guard.writer;

        if w.map.is_none() {
            self.roll(w)?;
        } else if w.offset + need > self.segment_size {
            // Next record would overflow: seal and roll. The tail bytes stay
            // as zero padding.
            self.seal(w)?;
            self.roll(w)?;
        }

        let offset = w.offset;
        let map = w.map.as_mut().expect("active write segment is mapped");
        map[offset] = FLAG_VALID;
        map[offset + 1..offset + 9].copy_from_slice(&id.to_be_bytes());
        map[offset + 9..offset + 13].copy_from_slice(&(payload.len() as u32).to_be_bytes());
        map[offset + 13..offset + need].copy_from_slice(payload);

        w.offset += need;
        w.wmap.insert(w.fid, w.offset);
        Ok(())
    }

    /// Read the next record. `Ok(None)` means the reader has caught up with
    /// the writer (no-data).
    pub fn read(&self) -> Result<Option<(u64, Vec<u8>)>, SpoolError> {
        let mut guard = self.inner.lock().expect("spool lock poisoned");
        let inner = &mut *guard;

        loop {
            if inner.reader.map.is_none() && !self.open_next(&mut inner.reader)? {
                return Ok(None);
            }

            let r = &mut inner.reader;
            let Some(&limit) = inner.writer.wmap.get(&r.fid) else {
                // Writer never reached this segment.
                return Ok(None);
            };
            let sealed = r.fid < inner.writer.fid;
            let map = r.map.as_ref().expect("read segment is mapped");

            if sealed {
                // A sealed segment ends where no header fits or at the first
                // padding byte (segments are created zero-filled).
                if self.segment_size - r.offset < RECORD_HEADER || map[r.offset] == 0 {
                    self.drain(r)?;
                    continue;
                }
            } else if r.offset == limit {
                // Caught up with the writer inside the active segment.
                return Ok(None);
            }

            let flag = map[r.offset];
            if flag != FLAG_VALID {
                return Err(SpoolError::CorruptRecord {
                    fid: r.fid,
                    offset: r.offset,
                });
            }

            let id = u64::from_be_bytes(
                map[r.offset + 1..r.offset + 9]
                    .try_into()
                    .expect("slice length"),
            );
            let len = u32::from_be_bytes(
                map[r.offset + 9..r.offset + 13]
                    .try_into()
                    .expect("slice length"),
            ) as usize;

            let end = r.offset + RECORD_HEADER + len;
            if end > limit {
                return Err(SpoolError::CorruptRecord {
                    fid: r.fid,
                    offset: r.offset,
                });
            }

            let payload = map[r.offset + 13..end].to_vec();
            r.offset = end;

            if sealed && r.offset == self.segment_size {
                // Exactly-filled segment; the record is already out, so a
                // failed delete only leaks the file.
                if let Err(err) = self.drain(r) {
                    tracing::warn!(queue = %self.name, fid = r.fid, %err, "drained segment not removed");
                }
            }

            return Ok(Some((id, payload)));
        }
    }

    /// msync the active write segment.
    pub fn flush(&self) -> Result<(), SpoolError> {
        let guard = self.inner.lock().expect("spool lock poisoned");
        if let Some(map) = guard.writer.map.as_ref() {
            map.flush()?;
        }
        Ok(())
    }

    /// Flush and unmap both sides. A fully-drained queue leaves no segment
    /// file behind; positions are process-local, so anything else left on
    /// disk is unreadable by a future `Spool` anyway.
    pub fn close(&self) -> Result<(), SpoolError> {
        let mut guard = self.inner.lock().expect("spool lock poisoned");
        let inner = &mut *guard;

        inner.reader.map = None;

        let drained = inner.reader.fid == inner.writer.fid
            && inner.reader.offset == inner.writer.offset;

        if let Some(map) = inner.writer.map.take() {
            map.flush()?;
            drop(map);
            if drained {
                std::fs::remove_file(self.segment_path(inner.writer.fid))?;
            }
        }
        Ok(())
    }

    /// Open and map segment `fid + 1` for writing, zero-extended to the full
    /// segment size. Writer state is only advanced once mapping succeeded.
    fn roll(&self, w: &mut Writer) -> Result<(), SpoolError> {
        let fid = w.fid + 1;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .mode(0o600)
            .open(self.segment_path(fid))?;
        file.set_len(self.segment_size as u64)?;
        let map = unsafe { MmapOptions::new().len(self.segment_size).map_mut(&file)? };

        w.fid = fid;
        w.offset = 0;
        w.map = Some(map);
        Ok(())
    }

    /// Seal the active write segment: flush, publish the full segment size,
    /// unmap. The file stays on disk for the reader.
    fn seal(&self, w: &mut Writer) -> Result<(), SpoolError> {
        if let Some(map) = w.map.as_ref() {
            map.flush()?;
            w.wmap.insert(w.fid, self.segment_size);
            w.map = None;
        }
        Ok(())
    }

    /// Open segment `fid + 1` read-only. `Ok(false)` when it does not exist
    /// yet (no-data).
    fn open_next(&self, r: &mut Reader) -> Result<bool, SpoolError> {
        let file = match OpenOptions::new().read(true).open(self.segment_path(r.fid + 1)) {
            Ok(f) => f,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        let map = unsafe { MmapOptions::new().len(self.segment_size).map(&file)? };

        r.fid += 1;
        r.offset = 0;
        r.map = Some(map);
        Ok(true)
    }

    /// Fully-consumed segment: unmap, then delete the file.
    fn drain(&self, r: &mut Reader) -> Result<(), SpoolError> {
        r.map = None;
        std::fs::remove_file(self.segment_path(r.fid))?;
        Ok(())
    }
}
