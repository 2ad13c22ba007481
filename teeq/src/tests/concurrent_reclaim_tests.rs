use std::{
    error::Error,
    sync::{
        atomic::{AtomicBool, Ordering as AtomicOrdering},
        Arc,
    },
    thread,
    time::Duration,
};

use crate::{
    core::{queue, QueueConfig},
    reader::RecordReader,
    writer::RecordWriter,
    QueueError,
};

// Records carry their own id and a body derived from it, so a reader can
// tell a record it should not be seeing (reordered, torn or freed) from a
// good one.
#[derive(Debug, Clone, PartialEq)]
struct StressRecord {
    id: u64,
    body: Vec<u8>,
}

impl StressRecord {
    fn new(id: u64) -> Self {
        let len = (id % 17) as usize + 1;
        let val = b'a' + (id % 26) as u8;
        StressRecord {
            id,
            body: vec![val; len],
        }
    }

    fn to_line(&self) -> Vec<u8> {
        let mut line = format!("{}:", self.id).into_bytes();
        line.extend_from_slice(&self.body);
        line.push(b'\n');
        line
    }

    fn from_line(line: &[u8]) -> Option<Self> {
        let line = line.strip_suffix(b"\n")?;
        let colon = line.iter().position(|&b| b == b':')?;
        let id = std::str::from_utf8(&line[..colon]).ok()?.parse().ok()?;
        Some(StressRecord {
            id,
            body: line[colon + 1..].to_vec(),
        })
    }

    fn is_consistent(&self) -> bool {
        *self == StressRecord::new(self.id)
    }
}

fn setup(
    chunk_capacity: usize,
    consumers: usize,
) -> Result<(RecordWriter, Vec<RecordReader>), QueueError> {
    queue(&QueueConfig {
        chunk_capacity,
        consumers,
    })
}

/// Reads until end of stream, checking order and content, with an
/// occasional yield so readers drift apart.
fn verify_reader(mut reader: RecordReader, jitter: u64) -> (u64, usize) {
    let mut expected = 0u64;
    let mut bad = 0usize;
    while let Some(parsed) = reader.read(StressRecord::from_line) {
        match parsed {
            Some(record) if record.id == expected && record.is_consistent() => {}
            _ => bad += 1,
        }
        expected += 1;
        if jitter > 0 && expected % jitter == 0 {
            thread::yield_now();
        }
    }
    (expected, bad)
}

#[test]
fn test_stress_record_line_format() {
    let original = StressRecord::new(12345);
    let line = original.to_line();
    assert_eq!(StressRecord::from_line(&line), Some(original.clone()));
    assert!(original.is_consistent());

    let mut damaged = original.clone();
    damaged.body[0] = damaged.body[0].wrapping_add(1);
    assert!(!damaged.is_consistent());
    assert_eq!(StressRecord::from_line(b"no-colon\n"), None);
    assert_eq!(StressRecord::from_line(b"7:aaaaaaaa"), None);
}

#[test]
fn test_readers_racing_the_writer_see_every_record() -> Result<(), Box<dyn Error>> {
    let records = 200_000u64;
    // A small capacity puts many chunk boundaries, and so many reclaim
    // races, into one run.
    let (mut writer, readers) = setup(7, 2)?;
    let monitor = writer.monitor();

    let reader_threads: Vec<_> = readers
        .into_iter()
        .enumerate()
        .map(|(i, reader)| thread::spawn(move || verify_reader(reader, 97 + i as u64 * 31)))
        .collect();

    let writer_thread = thread::spawn(move || -> Result<u64, QueueError> {
        for id in 0..records {
            writer.push(StressRecord::new(id).to_line())?;
        }
        writer.close();
        Ok(writer.written())
    });

    assert_eq!(writer_thread.join().expect("writer thread panicked")?, records);
    for handle in reader_threads {
        let (seen, bad) = handle.join().expect("reader thread panicked");
        assert_eq!(seen, records);
        assert_eq!(bad, 0);
    }

    let stats = monitor.stats();
    let expected_chunks = (records as usize) / 7 + 1;
    assert_eq!(stats.chunks_allocated, expected_chunks);
    assert_eq!(stats.chunks_reclaimed, expected_chunks);
    assert_eq!(stats.chunks_dropped, expected_chunks);
    assert_eq!(stats.live_chunks, 0);
    assert_eq!(stats.records_published, records);
    Ok(())
}

#[test]
fn test_three_readers_reclaim_each_chunk_once() -> Result<(), Box<dyn Error>> {
    let records = 50_000u64;
    let (mut writer, readers) = setup(1, 3)?;
    let monitor = writer.monitor();

    let reader_threads: Vec<_> = readers
        .into_iter()
        .map(|reader| thread::spawn(move || verify_reader(reader, 13)))
        .collect();
    for id in 0..records {
        writer.push(StressRecord::new(id).to_line())?;
    }
    drop(writer);

    for handle in reader_threads {
        assert_eq!(handle.join().expect("reader thread panicked"), (records, 0));
    }
    let stats = monitor.stats();
    // Capacity 1: one chunk per record plus the one holding the end marker.
    assert_eq!(stats.chunks_allocated, records as usize + 1);
    assert_eq!(stats.chunks_reclaimed, stats.chunks_allocated);
    assert_eq!(stats.chunks_dropped, stats.chunks_allocated);
    Ok(())
}

#[test]
fn test_lockstep_readers_keep_memory_flat() -> Result<(), Box<dyn Error>> {
    let (mut writer, mut readers) = setup(10, 2)?;
    let monitor = writer.monitor();
    for id in 0..10_000u64 {
        writer.push(StressRecord::new(id).to_line())?;
        for reader in readers.iter_mut() {
            let record = reader.read(StressRecord::from_line).flatten();
            assert_eq!(record.map(|r| r.id), Some(id));
        }
    }
    writer.close();

    let stats = monitor.stats();
    assert_eq!(stats.chunks_allocated, 1_001);
    // The chunk being written plus its freshly linked successor.
    assert!(stats.peak_live_chunks <= 2, "peak live chunks {}", stats.peak_live_chunks);
    Ok(())
}

#[test]
fn test_parked_readers_wake_when_the_writer_publishes() -> Result<(), Box<dyn Error>> {
    let (mut writer, readers) = setup(4, 2)?;
    let stop_flag = Arc::new(AtomicBool::new(false));

    let reader_threads: Vec<_> = readers
        .into_iter()
        .map(|reader| {
            let stop_flag = Arc::clone(&stop_flag);
            thread::spawn(move || {
                let result = verify_reader(reader, 0);
                // The writer only closes after the stop flag is raised.
                assert!(stop_flag.load(AtomicOrdering::SeqCst));
                result
            })
        })
        .collect();

    // Slow enough that readers exhaust their backoff and park between records.
    for id in 0..20u64 {
        writer.push(StressRecord::new(id).to_line())?;
        thread::sleep(Duration::from_millis(5));
    }
    stop_flag.store(true, AtomicOrdering::SeqCst);
    writer.close();

    for handle in reader_threads {
        assert_eq!(handle.join().expect("reader thread panicked"), (20, 0));
    }
    Ok(())
}
