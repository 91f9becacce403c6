use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::{AuditEvent, AuditSink};

/// Encode a single record as `[u32: len][bincode: AuditEvent][u32: crc32]`.
fn encode_record(writer: &mut impl Write, event: &AuditEvent) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

struct Appender {
    writer: BufWriter<File>,
}

impl Appender {
    fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    fn append_buffered(&mut self, event: &AuditEvent) -> io::Result<()> {
        encode_record(&mut self.writer, event)
    }

    fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }
}

type Pending = (AuditEvent, oneshot::Sender<io::Result<()>>);

/// Background task that owns the file and batches appends:
/// block for the first record, drain whatever else is queued, one fsync, answer everyone.
async fn writer_loop(mut appender: Appender, mut rx: mpsc::Receiver<Pending>) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
        }

        metrics::histogram!(crate::observability::AUDIT_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut appender, &batch);
        metrics::histogram!(crate::observability::AUDIT_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());

        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }
    }
}

fn flush_batch(appender: &mut Appender, batch: &[Pending]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = appender.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so half-written bytes don't
    // bleed into the next batch.
    let flush_err = appender.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

/// Durable audit sink: an append-only file with group commit.
pub struct AuditFile {
    tx: mpsc::Sender<Pending>,
    path: PathBuf,
}

impl AuditFile {
    /// Open (or create) the log and spawn its writer. Must run inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let appender = Appender::open(path)?;
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(writer_loop(appender, rx));
        Ok(Self {
            tx,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every intact record. A truncated or corrupt tail is dropped.
    pub fn replay(path: &Path) -> io::Result<Vec<AuditEvent>> {
        Ok(scan(path)?.0)
    }

    /// Read back what is on disk, cut any torn tail so new records are not
    /// appended behind garbage, then open for append.
    pub fn resume(path: &Path) -> io::Result<(Self, Vec<AuditEvent>)> {
        let (events, intact) = scan(path)?;
        if let Ok(meta) = std::fs::metadata(path)
            && meta.len() > intact
        {
            OpenOptions::new().write(true).open(path)?.set_len(intact)?;
        }
        Ok((Self::open(path)?, events))
    }
}

/// Records larger than this are treated as a corrupt length prefix.
const MAX_RECORD_BYTES: u32 = 1 << 20;

/// All intact records plus the byte length of the intact prefix.
fn scan(path: &Path) -> io::Result<(Vec<AuditEvent>, u64)> {
    let mut reader = match File::open(path) {
        Ok(f) => BufReader::new(f),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut events = Vec::new();
    let mut intact = 0u64;
    while let Some((event, size)) = next_record(&mut reader)? {
        events.push(event);
        intact += size;
    }
    Ok((events, intact))
}

/// `None` at a clean end, a torn record, or a record failing its checksum.
fn next_record(reader: &mut impl Read) -> io::Result<Option<(AuditEvent, u64)>> {
    let Some(len) = read_u32(reader)? else {
        return Ok(None);
    };
    if len > MAX_RECORD_BYTES {
        return Ok(None);
    }
    let mut payload = vec![0u8; len as usize];
    if !fill(reader, &mut payload)? {
        return Ok(None);
    }
    match read_u32(reader)? {
        Some(crc) if crc == crc32fast::hash(&payload) => {}
        _ => return Ok(None),
    }
    Ok(bincode::deserialize(&payload)
        .ok()
        .map(|event| (event, 8 + u64::from(len))))
}

fn read_u32(reader: &mut impl Read) -> io::Result<Option<u32>> {
    let mut buf = [0u8; 4];
    Ok(fill(reader, &mut buf)?.then(|| u32::from_le_bytes(buf)))
}

/// Fill `buf`, or report `false` if the input ends first.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl AuditSink for AuditFile {
    async fn append(&self, event: AuditEvent) -> io::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send((event, tx))
            .await
            .map_err(|_| io::Error::other("audit writer shut down"))?;
        rx.await
            .map_err(|_| io::Error::other("audit writer dropped response"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditKind;
    use crate::model::*;
    use std::fs;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("tablehold_test_audit");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn event(kind: AuditKind, at: Ms) -> AuditEvent {
        let key = CacheKey {
            venue_id: 1,
            service_id: 1,
            date: parse_date("2024-06-01").unwrap(),
        };
        AuditEvent::for_day(kind, &key, at).with_client(Some("abcd".into()))
    }

    #[tokio::test]
    async fn append_and_replay() {
        let path = tmp_path("append_and_replay.log");
        let sink = AuditFile::open(&path).unwrap();
        let events = vec![
            event(AuditKind::Held, 1),
            event(AuditKind::CacheInvalidate, 2),
            event(AuditKind::Released, 3),
        ];
        for e in &events {
            sink.append(e.clone()).await.unwrap();
        }
        assert_eq!(AuditFile::replay(sink.path()).unwrap(), events);
    }

    #[tokio::test]
    async fn concurrent_appends_all_land() {
        let path = tmp_path("concurrent.log");
        let sink = std::sync::Arc::new(AuditFile::open(&path).unwrap());
        let tasks: Vec<_> = (0..50)
            .map(|i| {
                let sink = sink.clone();
                tokio::spawn(async move { sink.append(event(AuditKind::Check, i)).await })
            })
            .collect();
        for t in futures::future::join_all(tasks).await {
            t.unwrap().unwrap();
        }
        assert_eq!(AuditFile::replay(&path).unwrap().len(), 50);
    }

    #[tokio::test]
    async fn replay_drops_truncated_tail() {
        let path = tmp_path("truncated.log");
        {
            let sink = AuditFile::open(&path).unwrap();
            sink.append(event(AuditKind::Held, 1)).await.unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap();
        }
        let replayed = AuditFile::replay(&path).unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].kind, AuditKind::Held);
    }

    #[tokio::test]
    async fn resume_cuts_torn_tail_before_appending() {
        let path = tmp_path("resume.log");
        {
            let sink = AuditFile::open(&path).unwrap();
            sink.append(event(AuditKind::Held, 1)).await.unwrap();
            sink.append(event(AuditKind::Released, 2)).await.unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 11]).unwrap();
        }

        let (sink, prior) = AuditFile::resume(&path).unwrap();
        assert_eq!(prior.len(), 2);
        sink.append(event(AuditKind::Expired, 3)).await.unwrap();

        let kinds: Vec<_> = AuditFile::replay(sink.path()).unwrap().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![AuditKind::Held, AuditKind::Released, AuditKind::Expired]);
    }

    #[test]
    fn oversized_length_prefix_ends_replay() {
        let path = tmp_path("oversized.log");
        std::fs::write(&path, u32::MAX.to_le_bytes()).unwrap();
        assert!(AuditFile::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("bad_crc.log");
        let payload = bincode::serialize(&event(AuditKind::Expired, 9)).unwrap();
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }
        assert!(AuditFile::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("missing.log");
        assert!(AuditFile::replay(&path).unwrap().is_empty());
    }
}
